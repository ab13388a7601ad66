//! guest agent prelude

pub use crate::{
    anyhow::{self, Context},
    async_trait,
    backend::Backend,
    error::{Error, Result},
    exec,
    resolve::{EthernetInterface, Interfaces, VlanInterface},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{io, sync::Arc};
