//! Reassembles `FE FE … FD`-framed CI-V frames out of a stream of inbound
//! CI-V packet payloads that may split or batch frames arbitrarily (§4.6).

const NOISE_CAP: usize = 1024;

#[derive(Debug, Default)]
pub struct CivReassembler {
    buf: Vec<u8>,
}

impl CivReassembler {
    pub fn new() -> Self {
        CivReassembler { buf: Vec::new() }
    }

    /// Feed newly-arrived bytes and drain as many complete frames as the
    /// buffer now contains, in the order they appear on the wire.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find_frame_start(&self.buf) else {
                // No `FE FE` pair present; drop noise once it's grown
                // large enough that it can't be a prefix of a real frame.
                if self.buf.len() > NOISE_CAP {
                    let last = self.buf.pop();
                    self.buf.clear();
                    if let Some(b) = last {
                        self.buf.push(b);
                    }
                }
                break;
            };
            if start > 0 {
                self.buf.drain(0..start);
            }
            match self.buf.iter().skip(2).position(|&b| b == 0xfd) {
                Some(rel) => {
                    let end = 2 + rel + 1; // inclusive of FD
                    frames.push(self.buf[0..end].to_vec());
                    self.buf.drain(0..end);
                }
                None => break,
            }
        }
        frames
    }
}

fn find_frame_start(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == [0xfe, 0xfe])
}
