/// Zero-based column index of the letter prefix of a cell reference.
///
/// `"A1"` is 0, `"Z1"` is 25, `"AA5"` is 26. Digits after the letters are
/// ignored; a reference with no leading letters yields `None`.
pub fn col_ref_to_index(cell_ref: &str) -> Option<u32> {
    let mut col: u32 = 0;
    let mut letters = 0usize;

    for b in cell_ref.bytes() {
        if !b.is_ascii_alphabetic() {
            break;
        }
        letters += 1;
        let digit = u32::from(b.to_ascii_uppercase() - b'A') + 1;
        col = col.checked_mul(26)?.checked_add(digit)?;
    }

    if letters == 0 {
        return None;
    }
    Some(col - 1)
}

/// Parse an A1 address into zero-based (row, col) indices.
/// Returns `None` for malformed addresses.
pub fn address_to_index(a1: &str) -> Option<(u32, u32)> {
    let split = a1.find(|c: char| !c.is_ascii_alphabetic())?;
    let (letters, digits) = a1.split_at(split);
    if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let col = col_ref_to_index(letters)?;
    let row: u32 = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col))
}
