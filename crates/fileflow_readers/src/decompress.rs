//! Transparent gzip decoding ahead of the format readers.

use flate2::read::GzDecoder;
use std::io::Read;

/// Wrap a stream in a gzip decoder when the source asks for one.
/// All reader contracts are unchanged behind the decoder.
pub fn maybe_gunzip(stream: Box<dyn Read + Send>, gzip: bool) -> Box<dyn Read + Send> {
    if gzip {
        Box::new(GzDecoder::new(stream))
    } else {
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn decodes_gzip_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"id,name\n1,ada\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decoded = String::new();
        maybe_gunzip(Box::new(std::io::Cursor::new(compressed)), true)
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "id,name\n1,ada\n");
    }

    #[test]
    fn passthrough_when_disabled() {
        let mut out = String::new();
        maybe_gunzip(Box::new(std::io::Cursor::new(b"plain".to_vec())), false)
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "plain");
    }
}
