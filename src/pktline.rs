use std::io::{self, Read, Write};

/// Maximum length of a pkt-line frame, including the 4-byte length prefix.
pub const MAX_PKT_LINE_LENGTH: usize = 65520;

/// A single frame of the git pkt-line stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Data(Vec<u8>),
}

pub struct PktLineReader<R: Read> {
    inner: R,
}

impl<R: Read> PktLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame. Returns `None` at end of stream.
    pub fn read_pkt_line(&mut self) -> io::Result<Option<PktLine>> {
        let mut length_hex = [0u8; 4];
        match self.inner.read_exact(&mut length_hex) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        let length_str = std::str::from_utf8(&length_hex)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed pkt-line length"))?;
        let length = usize::from_str_radix(length_str, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed pkt-line length"))?;

        if length == 0 {
            return Ok(Some(PktLine::Flush));
        }
        if length < 4 || length > MAX_PKT_LINE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("pkt-line length {length} out of range"),
            ));
        }

        let mut data = vec![0u8; length - 4];
        self.inner.read_exact(&mut data)?;
        Ok(Some(PktLine::Data(data)))
    }

    /// Returns the underlying reader, positioned just past the last frame
    /// read. Used to hand the remainder of a request body (the packfile) to
    /// the packfile pipeline.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct PktLineWriter<W: Write> {
    inner: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_pkt_line(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() + 4 > MAX_PKT_LINE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pkt-line payload too long",
            ));
        }
        write!(self.inner, "{:04x}", data.len() + 4)?;
        self.inner.write_all(data)
    }

    pub fn flush_pkt(&mut self) -> io::Result<()> {
        self.inner.write_all(b"0000")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_pkt_line(b"unpack ok\n").unwrap();
            writer.flush_pkt().unwrap();
        }
        assert_eq!(&buf[..4], b"000e");

        let mut reader = PktLineReader::new(buf.as_slice());
        assert_eq!(
            reader.read_pkt_line().unwrap(),
            Some(PktLine::Data(b"unpack ok\n".to_vec()))
        );
        assert_eq!(reader.read_pkt_line().unwrap(), Some(PktLine::Flush));
        assert_eq!(reader.read_pkt_line().unwrap(), None);
    }

    #[test]
    fn test_rejects_malformed_length() {
        let mut reader = PktLineReader::new(&b"zzzz"[..]);
        assert!(reader.read_pkt_line().is_err());

        let mut reader = PktLineReader::new(&b"0002"[..]);
        assert!(reader.read_pkt_line().is_err());
    }
}
