//! Query helpers over the dynamic XML tree at the SOAP boundary.

use xmltree::Element;

/// Get the first child element with the given (namespace-free) name.
pub fn first_child<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    element.get_child(name)
}

/// Get the trimmed text content of a named child element.
pub fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
}

/// Get the text content of a named child, parsed into `T`.
pub fn child_parse<T: std::str::FromStr>(element: &Element, name: &str) -> Option<T> {
    child_text(element, name).and_then(|text| text.parse().ok())
}

/// Escape text for inclusion in an XML element or attribute value.
///
/// Escapes `&<>"'` only; pre-existing entities in the input are escaped
/// again, callers that need pass-through must not double-encode.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode the five XML entities produced by [`escape`], plus decimal and
/// hex character references.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            out.push_str(rest);
            return out;
        };
        let entity = &rest[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let decoded = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32);
                match decoded {
                    Some(c) => out.push(c),
                    None => {
                        // Unknown entity, keep it verbatim
                        out.push_str(&rest[..=end]);
                    }
                }
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(
            escape(r#"Tom & Jerry <"live">"#),
            "Tom &amp; Jerry &lt;&quot;live&quot;&gt;"
        );
        assert_eq!(escape("it's"), "it&apos;s");
    }

    #[test]
    fn test_unescape_round_trip() {
        let original = r#"Tom & Jerry <"live"> it's"#;
        assert_eq!(unescape(&escape(original)), original);
    }

    #[test]
    fn test_unescape_character_references() {
        assert_eq!(unescape("caf&#233;"), "café");
        assert_eq!(unescape("caf&#xE9;"), "café");
    }

    #[test]
    fn test_unescape_keeps_unknown_entities() {
        assert_eq!(unescape("a &unknown; b"), "a &unknown; b");
    }

    #[test]
    fn test_child_helpers() {
        let xml = r#"<root><Volume>42</Volume><Name> Kitchen </Name></root>"#;
        let element = Element::parse(xml.as_bytes()).unwrap();
        assert_eq!(child_text(&element, "Name").as_deref(), Some("Kitchen"));
        assert_eq!(child_parse::<u8>(&element, "Volume"), Some(42));
        assert!(first_child(&element, "Missing").is_none());
    }
}
