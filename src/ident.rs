//! Identifier canonicalization for ASINs and EAN/UPC/GTIN barcodes.
//!
//! Pure functions, no state. Invalid input comes back as `None`; it is
//! never an error at this layer.

/// Uppercases and validates an ASIN: exactly 10 ASCII alphanumerics.
pub fn normalize_asin(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() != 10 {
        return None;
    }
    if !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}

/// Strips every non-digit and validates length 8..=14.
pub fn normalize_barcode(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|ch| ch.is_ascii_digit()).collect();
    if (8..=14).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}

/// All representation variants of a canonical barcode. Always includes
/// the code itself; a 12-digit UPC-A also yields its zero-padded EAN-13
/// form, and a 13-digit code with a leading zero also yields the
/// stripped 12-digit form. This absorbs UPC/EAN skew between supplier
/// files and remote records.
pub fn barcode_variants(code: &str) -> Vec<String> {
    let mut variants = vec![code.to_string()];
    if code.len() == 12 {
        variants.push(format!("0{code}"));
    } else if code.len() == 13 && code.starts_with('0') {
        variants.push(code[1..].to_string());
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asin_uppercased_and_validated() {
        assert_eq!(normalize_asin(" b07abc1234 "), Some("B07ABC1234".into()));
        assert_eq!(normalize_asin("B07ABC123"), None);
        assert_eq!(normalize_asin("B07ABC12345"), None);
        assert_eq!(normalize_asin("B07ABC-234"), None);
        assert_eq!(normalize_asin(""), None);
    }

    #[test]
    fn barcode_strips_non_digits() {
        assert_eq!(
            normalize_barcode(" 50-1234567-8903 "),
            Some("5012345678903".into())
        );
        assert_eq!(normalize_barcode("1234567"), None);
        assert_eq!(normalize_barcode("123456789012345"), None);
        assert_eq!(normalize_barcode("no digits"), None);
    }

    #[test]
    fn variants_pad_upc_a() {
        let variants = barcode_variants("036000291452");
        assert_eq!(variants, vec!["036000291452", "0036000291452"]);
    }

    #[test]
    fn variants_strip_leading_zero_ean13() {
        let variants = barcode_variants("0036000291452");
        assert_eq!(variants, vec!["0036000291452", "036000291452"]);
    }

    #[test]
    fn variants_other_lengths_are_canonical_only() {
        assert_eq!(barcode_variants("40123455"), vec!["40123455"]);
        assert_eq!(barcode_variants("5012345678900"), vec!["5012345678900"]);
        assert_eq!(barcode_variants("50123456789012"), vec!["50123456789012"]);
    }
}
