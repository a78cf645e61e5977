use chainbms_lib::{transport::Bus, Error};
use std::collections::VecDeque;

/// Plays back one scripted reply per written frame, in order. An empty
/// entry (or an exhausted script) leaves the bus silent for that request.
pub struct ScriptedBus {
    replies: VecDeque<Vec<u8>>,
    rx: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
}

impl ScriptedBus {
    pub fn new(replies: Vec<Vec<u8>>) -> Self {
        Self {
            replies: replies.into(),
            rx: VecDeque::new(),
            writes: Vec::new(),
        }
    }
}

impl Bus for ScriptedBus {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writes.push(data.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, Error> {
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.rx.pop_front().unwrap_or(0))
    }
}
