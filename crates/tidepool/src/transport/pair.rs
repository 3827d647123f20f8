//! In-process duplex transport: two cross-wired unbounded channels plus a
//! shared closed flag, so closing either end severs both directions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{Transport, TransportAcceptor, TransportError, TransportResult};

pub struct TransportPair {
    pub host: Arc<dyn Transport>,
    pub client: Arc<dyn Transport>,
}

/// Build a connected in-process transport pair.
pub fn pair() -> TransportPair {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);

    let host = Arc::new(PairEndpoint {
        outbound: to_client_tx,
        inbound: Mutex::new(to_host_rx),
        closed_tx: Arc::clone(&closed_tx),
        closed_rx: closed_rx.clone(),
    });
    let client = Arc::new(PairEndpoint {
        outbound: to_host_tx,
        inbound: Mutex::new(to_client_rx),
        closed_tx,
        closed_rx,
    });
    TransportPair { host, client }
}

struct PairEndpoint {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Transport for PairEndpoint {
    async fn send(&self, frame: String) -> TransportResult<()> {
        if *self.closed_rx.borrow() {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> TransportResult<String> {
        let mut inbound = self.inbound.lock().await;
        let mut closed = self.closed_rx.clone();
        if *closed.borrow_and_update() {
            return Err(TransportError::ChannelClosed);
        }
        tokio::select! {
            _ = closed.changed() => Err(TransportError::ChannelClosed),
            frame = inbound.recv() => frame.ok_or(TransportError::ChannelClosed),
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// Build an in-process listener plus the connector clients dial it with.
pub fn listener() -> (Arc<PairListener>, PairConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let acceptor = Arc::new(PairListener {
        incoming: Mutex::new(rx),
        closed_tx,
        closed_rx,
    });
    (acceptor, PairConnector { tx })
}

pub struct PairListener {
    incoming: Mutex<mpsc::UnboundedReceiver<Arc<dyn Transport>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl TransportAcceptor for PairListener {
    async fn accept(&self) -> TransportResult<Arc<dyn Transport>> {
        let mut incoming = self.incoming.lock().await;
        let mut closed = self.closed_rx.clone();
        if *closed.borrow_and_update() {
            return Err(TransportError::ChannelClosed);
        }
        tokio::select! {
            _ = closed.changed() => Err(TransportError::ChannelClosed),
            transport = incoming.recv() => transport.ok_or(TransportError::ChannelClosed),
        }
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// Client-side handle for dialing a [`PairListener`].
#[derive(Clone)]
pub struct PairConnector {
    tx: mpsc::UnboundedSender<Arc<dyn Transport>>,
}

impl PairConnector {
    /// Create a fresh pair, hand the host end to the listener, and return
    /// the client end.
    pub fn connect(&self) -> TransportResult<Arc<dyn Transport>> {
        let TransportPair { host, client } = pair();
        self.tx
            .send(host)
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_round_trip() {
        let pair = pair();
        pair.host
            .send("hello from host".to_string())
            .await
            .expect("host send");
        pair.client
            .send("hello from client".to_string())
            .await
            .expect("client send");

        assert_eq!(
            pair.client.recv().await.expect("client recv"),
            "hello from host"
        );
        assert_eq!(
            pair.host.recv().await.expect("host recv"),
            "hello from client"
        );
    }

    #[tokio::test]
    async fn frames_buffer_until_the_pump_attaches() {
        let pair = pair();
        for index in 0..3 {
            pair.host
                .send(format!("frame-{index}"))
                .await
                .expect("send");
        }
        for index in 0..3 {
            assert_eq!(
                pair.client.recv().await.expect("recv"),
                format!("frame-{index}")
            );
        }
    }

    #[tokio::test]
    async fn close_severs_both_directions() {
        let pair = pair();
        pair.client.close();
        assert!(!pair.host.is_open());
        assert_eq!(
            pair.host.send("late".to_string()).await,
            Err(TransportError::ChannelClosed)
        );
        assert_eq!(pair.host.recv().await, Err(TransportError::ChannelClosed));
        assert_eq!(pair.client.recv().await, Err(TransportError::ChannelClosed));
        // closing again is a no-op
        pair.client.close();
    }

    #[tokio::test]
    async fn listener_yields_one_transport_per_dial() {
        let (acceptor, connector) = listener();
        let client_a = connector.connect().expect("dial a");
        let client_b = connector.connect().expect("dial b");

        let host_a = acceptor.accept().await.expect("accept a");
        let host_b = acceptor.accept().await.expect("accept b");

        client_a.send("from a".to_string()).await.expect("send a");
        client_b.send("from b".to_string()).await.expect("send b");
        assert_eq!(host_a.recv().await.expect("recv a"), "from a");
        assert_eq!(host_b.recv().await.expect("recv b"), "from b");
    }

    #[tokio::test]
    async fn closed_listener_stops_accepting() {
        let (acceptor, connector) = listener();
        acceptor.close();
        assert_eq!(
            acceptor.accept().await.err(),
            Some(TransportError::ChannelClosed)
        );
        // dialing after close still hands out a client end, but nothing
        // will ever accept the host end
        let _ = connector.connect();
    }
}
