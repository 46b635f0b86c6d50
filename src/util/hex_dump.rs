use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Renders a byte slice as a classic hex dump - offset column, hex columns in two groups of
///  eight, and an ASCII gutter with non-printable bytes shown as '.'. Used by the dispatch
///  code for diagnostics on unexpected or undecipherable messages.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();

    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:08x}  ", line * BYTES_PER_LINE);

        for col in 0..BYTES_PER_LINE {
            match chunk.get(col) {
                Some(b) => { let _ = write!(out, "{:02x} ", b); }
                None => out.push_str("   "),
            }
            if col == 7 {
                out.push(' ');
            }
        }

        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' });
        }
        out.push('\n');
    }

    out
}
