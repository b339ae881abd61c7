//! Shared helpers

pub mod ports;

pub use ports::*;

/// Space-separated uppercase hex, as used in frame traces.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0x03, 0xC4, 0x0B]), "01 03 C4 0B");
        assert_eq!(hex_dump(&[]), "");
    }
}
