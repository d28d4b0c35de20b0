/// A frame's bytes, either owned by the connection or borrowed from static
/// protocol data (the CMI init message).
///
/// Inbound frames are copied into owned buffers when they are queued; the
/// component that dequeues one holds it until it goes out of scope, so the
/// backing storage is released exactly once. Dropping a borrowed buffer
/// leaves the referenced data untouched.
#[derive(Debug)]
pub enum MessageBuffer {
    Borrowed(&'static [u8]),
    Owned(Box<[u8]>),
}

impl MessageBuffer {
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_ref().is_empty()
    }
}

impl AsRef<[u8]> for MessageBuffer {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Borrowed(bytes) => bytes,
            Self::Owned(bytes) => bytes,
        }
    }
}

impl From<Vec<u8>> for MessageBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes.into_boxed_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_buffer_exposes_its_bytes() {
        let buf = MessageBuffer::from(vec![0x02, 0x7b, 0x7d]);
        assert_eq!(buf.as_ref(), &[0x02, 0x7b, 0x7d]);
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_empty());
    }

    #[test]
    fn borrowed_buffer_points_at_static_data() {
        static INIT: [u8; 2] = [0x01, 0x00];
        let buf = MessageBuffer::Borrowed(&INIT);
        assert_eq!(buf.as_ref(), &INIT);
    }
}
