use std::collections::VecDeque;

use protocol::{Query, QUERY_PACKET_SIZE};
use tracing::trace;

use crate::error::Result;
use crate::transport::Transport;

/// Flow-controlled query sender. Credit starts at the client's announced
/// send-buffer capacity divided by the packet size and is returned one unit
/// per resolution record, so in-flight queries never overrun the client.
pub struct QueryChannel {
    credit: usize,
    backlog: VecDeque<Query>,
}

impl QueryChannel {
    pub fn new(send_buffer_bytes: usize) -> Self {
        QueryChannel {
            credit: send_buffer_bytes / QUERY_PACKET_SIZE,
            backlog: VecDeque::new(),
        }
    }

    pub fn in_backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn send<T: Transport + ?Sized>(&mut self, transport: &mut T, query: Query) -> Result<()> {
        if self.credit > 0 {
            self.credit -= 1;
            transport.write_all(&query.encode())?;
        } else {
            trace!(?query, "query deferred, no credit");
            self.backlog.push_front(query);
        }
        Ok(())
    }

    /// Returns one credit and sends backlogged queries while credit lasts,
    /// oldest first.
    pub fn replenish<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        self.credit += 1;
        while self.credit > 0 {
            let Some(query) = self.backlog.pop_back() else {
                break;
            };
            self.credit -= 1;
            transport.write_all(&query.encode())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ChannelTransport;
    use protocol::QueryKind;

    fn sent_tokens(bytes: &[u8]) -> Vec<u64> {
        assert_eq!(bytes.len() % QUERY_PACKET_SIZE, 0);
        bytes
            .chunks_exact(QUERY_PACKET_SIZE)
            .map(|c| {
                let q = Query::decode(c.try_into().unwrap()).unwrap();
                q.token
            })
            .collect()
    }

    #[test]
    fn in_flight_never_exceeds_initial_credit() {
        let (mut server, mut client) = ChannelTransport::pair();
        // Two packets of credit.
        let mut chan = QueryChannel::new(2 * QUERY_PACKET_SIZE);
        for token in 0..5u64 {
            chan.send(&mut server, Query { kind: QueryKind::String, token })
                .unwrap();
        }
        assert_eq!(sent_tokens(&client.try_drain()), vec![0, 1]);
        assert_eq!(chan.in_backlog(), 3);

        chan.replenish(&mut server).unwrap();
        assert_eq!(sent_tokens(&client.try_drain()), vec![2]);
        chan.replenish(&mut server).unwrap();
        chan.replenish(&mut server).unwrap();
        assert_eq!(sent_tokens(&client.try_drain()), vec![3, 4]);
        assert_eq!(chan.in_backlog(), 0);
    }
}
