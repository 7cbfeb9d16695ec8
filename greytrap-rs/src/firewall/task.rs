//! The firewall helper task.
//!
//! Holds the only privileged firewall handle and answers protocol-syntax
//! requests from the connection engine, one message per request. Only the
//! `nat` request type is currently spoken on this channel.

use super::Firewall;
use crate::proto::{self, Message};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One request on the firewall pipe: the encoded message and a slot for
/// the encoded reply.
pub struct FwRequest {
    pub message: String,
    pub reply: oneshot::Sender<String>,
}

/// Serve requests until the channel closes.
pub async fn run_firewall_task(
    mut fw: Box<dyn Firewall>,
    mut requests: mpsc::UnboundedReceiver<FwRequest>,
) {
    while let Some(request) = requests.recv().await {
        let reply = match proto::parse(&request.message) {
            Ok(message) => handle_message(fw.as_mut(), &message).await,
            Err(e) => {
                warn!("firewall task: parse error: {e}");
                continue;
            }
        };

        if let Some(reply) = reply {
            // A dropped requester just means the lookup timed out.
            let _ = request.reply.send(reply);
        }
    }

    if let Err(e) = fw.close().await {
        warn!("firewall close: {e}");
    }
}

async fn handle_message(fw: &mut dyn Firewall, message: &Message) -> Option<String> {
    match message.get_str("type") {
        Some("nat") => {
            let dst = nat_lookup(fw, message).await;
            let dst = dst.map(|ip| ip.to_string()).unwrap_or_default();
            Some(Message::new().set_str("dst", &dst).emit())
        }
        other => {
            warn!("firewall task: unknown request type {other:?}");
            None
        }
    }
}

async fn nat_lookup(fw: &mut dyn Firewall, message: &Message) -> Option<IpAddr> {
    let src: IpAddr = message.get_str("src")?.parse().ok()?;
    let src_port = message.get_int("src_port")? as u16;
    let proxy: IpAddr = message.get_str("proxy")?.parse().ok()?;
    let proxy_port = message.get_int("proxy_port")? as u16;

    let src = SocketAddr::new(src, src_port);
    let proxy = SocketAddr::new(proxy, proxy_port);

    match fw.lookup_orig_dst(&src, &proxy).await {
        Ok(dst) => dst,
        Err(e) => {
            debug!("dnat lookup failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::DummyFirewall;

    #[tokio::test]
    async fn test_nat_request_gets_empty_dst_from_dummy() {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_firewall_task(Box::new(DummyFirewall::new()), rx));

        let request = Message::new()
            .set_str("type", "nat")
            .set_str("src", "192.0.2.1")
            .set_int("src_port", 40000)
            .set_str("proxy", "10.0.0.1")
            .set_int("proxy_port", 8025)
            .emit();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(FwRequest {
            message: request,
            reply: reply_tx,
        })
        .unwrap();

        let reply = reply_rx.await.unwrap();
        let parsed = proto::parse(&reply).unwrap();
        assert_eq!(parsed.get_str("dst"), Some(""));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_firewall_task(Box::new(DummyFirewall::new()), rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(FwRequest {
            message: Message::new().set_str("type", "replace").emit(),
            reply: reply_tx,
        })
        .unwrap();

        drop(tx);
        task.await.unwrap();
        // No reply is ever sent for unknown request types.
        assert!(reply_rx.await.is_err());
    }
}
