//! QR code rendering for pairing.
//!
//! Renders the room identifier as a terminal QR code using Unicode
//! half-block characters (two QR rows per terminal row, which gives a
//! roughly square aspect ratio since terminal cells are ~2:1).

use qrcode::{Color, EcLevel, QrCode};

/// Standard quiet zone, in modules, around the symbol.
const QUIET_ZONE: usize = 2;

/// Render `data` as terminal lines of half-block characters.
///
/// Returns `None` when the data cannot be encoded (far beyond any room
/// id, but the caller degrades to plain text rather than panicking).
pub fn qr_lines(data: &str) -> Option<Vec<String>> {
    let code = QrCode::with_error_correction_level(data, EcLevel::M)
        .or_else(|_| QrCode::with_error_correction_level(data, EcLevel::L))
        .ok()?;

    let colors = code.to_colors();
    let size = code.width();
    let total_size = size + QUIET_ZONE * 2;

    let dark_at = |x: usize, y: usize| -> bool {
        if x < QUIET_ZONE || y < QUIET_ZONE {
            return false;
        }
        let qx = x - QUIET_ZONE;
        let qy = y - QUIET_ZONE;
        if qx >= size || qy >= size {
            return false;
        }
        colors[qy * size + qx] == Color::Dark
    };

    let mut lines = Vec::with_capacity(total_size.div_ceil(2));
    for row_pair in 0..total_size.div_ceil(2) {
        let upper_y = row_pair * 2;
        let lower_y = upper_y + 1;
        let mut line = String::with_capacity(total_size);
        for x in 0..total_size {
            let upper = dark_at(x, upper_y);
            let lower = lower_y < total_size && dark_at(x, lower_y);
            line.push(match (upper, lower) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        lines.push(line);
    }
    Some(lines)
}

/// Print the pairing block for a room id: the QR code (when renderable)
/// followed by the id in plain text.
pub fn print_pairing(room_id: &str) {
    match qr_lines(room_id) {
        Some(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
        None => println!("(room id too long for a QR code)"),
    }
    println!("Scan the QR code with the mobile app. Room ID: {room_id}");
}
