//! Turns the long-poll loop into two event kinds: a single-shot readiness
//! signal and a continuous descriptor stream. Consumers must not act on a
//! descriptor until readiness has fired; the channel shapes enforce the
//! cheap half of that and [`Events::ready`] the rest.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Client, Error, NetworkDescriptor};

/// Pause between long-poll attempts after a parse failure; without it a
/// persistently bad body would spin the loop at request rate.
const FAILURE_PAUSE: Duration = Duration::from_secs(3);

/// Receiver half handed to the engine
#[derive(Debug)]
pub struct Events {
    /// flips to `true` once, when the first descriptor is obtained
    pub ready: watch::Receiver<bool>,
    /// long-poll results; consecutive identical failures are suppressed
    pub descriptors: mpsc::Receiver<Result<NetworkDescriptor, Error>>,
}

/// Spawn the watcher task. It runs until the token is cancelled or the
/// consumer drops [`Events`].
pub fn spawn(client: Arc<Client>, token: CancellationToken) -> (Events, JoinHandle<()>) {
    let (ready_tx, ready_rx) = watch::channel(false);
    let (desc_tx, desc_rx) = mpsc::channel(16);

    let handle = tokio::spawn(async move {
        let mut announced_ready = false;
        let mut failed_previous = false;
        loop {
            if token.is_cancelled() {
                debug!("metadata watcher stopping");
                return;
            }
            match client.watch(&token).await {
                Ok(descriptor) => {
                    failed_previous = false;
                    if !announced_ready {
                        // single-shot: never written again after this
                        announced_ready = true;
                        let _ = ready_tx.send(true);
                    }
                    if desc_tx.send(Ok(descriptor)).await.is_err() {
                        return;
                    }
                }
                Err(Error::Cancelled) => {
                    debug!("metadata watcher cancelled");
                    return;
                }
                Err(err) => {
                    if failed_previous {
                        // re-armed on the next success
                        debug!(%err, "metadata watch still failing");
                    } else {
                        warn!(%err, "metadata watch failed");
                        failed_previous = true;
                        if desc_tx.send(Err(err)).await.is_err() {
                            return;
                        }
                    }
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = time::sleep(FAILURE_PAUSE) => {}
                    }
                }
            }
        }
    });

    (
        Events {
            ready: ready_rx,
            descriptors: desc_rx,
        },
        handle,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    static BODY: &str =
        r#"{"instance": {"networkInterfaces": [{"mac": "00:11:22:33:44:55", "mtu": 1460}]}}"#;

    #[tokio::test]
    async fn ready_fires_before_first_descriptor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(BODY, "application/json"))
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        let (mut events, handle) = spawn(
            Arc::new(Client::with_base(server.uri())),
            token.clone(),
        );

        let event = events.descriptors.recv().await.unwrap().unwrap();
        // by the time any descriptor is observable, ready must already hold
        assert!(*events.ready.borrow());
        assert_eq!(event.ethernet[0].mac, "00:11:22:33:44:55");

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn parse_failure_is_reported_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("garbage", "text/plain"))
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        let (mut events, handle) = spawn(
            Arc::new(Client::with_base(server.uri())),
            token.clone(),
        );

        let first = events.descriptors.recv().await.unwrap();
        assert!(matches!(first, Err(Error::Unavailable(_))));
        assert!(!*events.ready.borrow());

        // the repeat failure is suppressed, nothing else arrives promptly
        let quiet =
            time::timeout(Duration::from_millis(200), events.descriptors.recv()).await;
        assert!(quiet.is_err());

        token.cancel();
        let _ = handle.await;
    }
}
