//! # Keyword Token Handling
//!
//! Reserved words of the rule grammar. Keywords are recognised by the
//! identifier parser after the whole word has been read, so `thisField` or
//! `nullable` stay identifiers.

/// Reserved words recognised by the rule grammar.
#[derive(
    Debug, Clone, PartialEq, strum::EnumString, strum::Display, strum::EnumIter, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    /// Boolean literal `true`.
    True,
    /// Boolean literal `false`.
    False,
    /// The `null` literal.
    Null,
    /// Optional answer-root prefix of a field reference (`this.qty`).
    This,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_from_str() {
        assert_eq!(Keyword::try_from("true").unwrap(), Keyword::True);
        assert_eq!(Keyword::try_from("this").unwrap(), Keyword::This);
        assert!(Keyword::try_from("thisField").is_err());
        assert!(Keyword::try_from("NULL").is_err());
    }
}
