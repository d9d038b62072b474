// =============================================================================
// normalize.rs — FIELD SCRUBBING
// =============================================================================
//
// Pure string helpers. No I/O, no allocation surprises, no opinions about
// anything other than hyphens and underscores.
// =============================================================================

/// Render a 9-digit EIN as `##-#######`. Anything else (wrong length,
/// non-digits, a sentinel like "N/A") comes back untouched.
pub fn format_tax_ein(ein: &str) -> String {
    if ein.len() != 9 || !ein.bytes().all(|b| b.is_ascii_digit()) {
        return ein.to_string();
    }
    format!("{}-{}", &ein[..2], &ein[2..])
}

/// Render a 10-digit phone number as `###-###-####`. Anything else comes
/// back untouched.
pub fn format_phone_number(phone: &str) -> String {
    if phone.len() != 10 || !phone.bytes().all(|b| b.is_ascii_digit()) {
        return phone.to_string();
    }
    format!("{}-{}-{}", &phone[..3], &phone[3..6], &phone[6..])
}

/// Turn a display label into the token every profile consumer keys on.
///
/// Spaces and hyphens become underscores, parentheses and dots vanish,
/// and `&` is spelled out as `and`.
pub fn normalize_key(label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 4);
    for c in label.chars() {
        match c {
            ' ' | '-' => out.push('_'),
            '(' | ')' | '.' => {}
            '&' => out.push_str("and"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ein_gets_one_hyphen_after_two_digits() {
        assert_eq!(format_tax_ein("123456789"), "12-3456789");
        assert_eq!(format_tax_ein("000000001"), "00-0000001");
    }

    #[test]
    fn test_ein_leaves_everything_else_alone() {
        for input in ["N/A", "12345678", "1234567890", "12345678a", "", "12-345678", "１２３４５６７８９"] {
            assert_eq!(format_tax_ein(input), input);
        }
    }

    #[test]
    fn test_phone_gets_two_hyphens() {
        assert_eq!(format_phone_number("5551234567"), "555-123-4567");
    }

    #[test]
    fn test_phone_leaves_everything_else_alone() {
        for input in ["N/A", "555123456", "55512345678", "555-123-4567", "(555)1234567", ""] {
            assert_eq!(format_phone_number(input), input);
        }
    }

    #[test]
    fn test_normalize_key_examples() {
        assert_eq!(normalize_key("Out of Service Date"), "Out_of_Service_Date");
        assert_eq!(normalize_key("Insurance BIPD (Required)"), "Insurance_BIPD_Required");
        assert_eq!(normalize_key("Driver OOS Rate National Average"), "Driver_OOS_Rate_National_Average");
        assert_eq!(normalize_key("Owner-Operator"), "Owner_Operator");
        assert_eq!(normalize_key("Safety & Compliance No."), "Safety_and_Compliance_No");
        assert_eq!(normalize_key("USDOT Number"), "USDOT_Number");
    }
}
