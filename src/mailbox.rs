use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use tracing::{error, warn};

use crate::message::Message;

const SEND_RETRY: usize = 3;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// The mailbox contract: at-most-once, in-order delivery per
/// `(sender thread, receiver thread)` link. Transport (TCP vs RDMA) lives
/// behind this trait; the in-process implementation below wires bounded
/// channels between every worker's expert threads.
pub trait Mailbox: Send + Sync {
    fn send(&self, msg: Message);
}

/// Sending half owned by one worker: a channel per `(worker, thread)`
/// destination queue.
pub struct LocalMailbox {
    senders: Vec<Vec<Sender<Message>>>,
}

impl Mailbox for LocalMailbox {
    fn send(&self, msg: Message) {
        let nid = msg.meta.recver_nid;
        let tid = msg.meta.recver_tid;
        let mut msg = msg;
        for attempt in 0..SEND_RETRY {
            match self.senders[nid][tid].send_timeout(msg, SEND_TIMEOUT) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    warn!(nid, tid, attempt, "mailbox queue full, retrying send");
                    msg = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    error!(nid, tid, "mailbox receiver gone, dropping message");
                    return;
                }
            }
        }
        error!(nid, tid, "mailbox send failed after retries, dropping message");
    }
}

/// Builds the full cluster fabric: one mailbox per worker plus each worker's
/// per-thread receive queues.
pub fn build_fabric(
    workers: usize,
    threads: usize,
    capacity: usize,
) -> (Vec<LocalMailbox>, Vec<Vec<Receiver<Message>>>) {
    let mut all_senders: Vec<Vec<Sender<Message>>> = Vec::with_capacity(workers);
    let mut all_receivers: Vec<Vec<Receiver<Message>>> = Vec::with_capacity(workers);
    for _ in 0..workers {
        let mut senders = Vec::with_capacity(threads);
        let mut receivers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let (tx, rx) = bounded(capacity);
            senders.push(tx);
            receivers.push(rx);
        }
        all_senders.push(senders);
        all_receivers.push(receivers);
    }

    let mailboxes = (0..workers)
        .map(|_| LocalMailbox {
            senders: all_senders.clone(),
        })
        .collect();
    (mailboxes, all_receivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{History, Meta, MsgType};
    use crate::plan::QueryPlan;
    use crate::types::Value;
    use std::sync::Arc;

    fn msg(nid: usize, tid: usize, tag: i64) -> Message {
        Message {
            meta: Meta {
                qid: 1,
                step: 0,
                sender_nid: 0,
                sender_tid: 0,
                recver_nid: nid,
                recver_tid: tid,
                parent_nid: 0,
                parent_tid: 0,
                msg_type: MsgType::Feed,
                msg_path: String::new(),
                branch_infos: Vec::new(),
            },
            plan: Arc::new(QueryPlan::default()),
            data: vec![(History::new(), vec![Value::Int(tag)])],
        }
    }

    #[test]
    fn per_link_fifo_order() {
        let (mailboxes, receivers) = build_fabric(2, 2, 64);
        for i in 0..10 {
            mailboxes[0].send(msg(1, 1, i));
        }
        let rx = &receivers[1][1];
        for i in 0..10 {
            let got = rx.recv().unwrap();
            assert_eq!(got.data[0].1[0], Value::Int(i));
        }
    }

    #[test]
    fn distinct_queues_do_not_interfere() {
        let (mailboxes, receivers) = build_fabric(1, 2, 64);
        mailboxes[0].send(msg(0, 0, 1));
        mailboxes[0].send(msg(0, 1, 2));
        assert_eq!(receivers[0][0].recv().unwrap().data[0].1[0], Value::Int(1));
        assert_eq!(receivers[0][1].recv().unwrap().data[0].1[0], Value::Int(2));
    }
}
