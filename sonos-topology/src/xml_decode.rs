//! XML decoding utilities for UPnP event parsing.
//!
//! Topology events arrive with namespace prefixes and an XML-escaped inner
//! document. Namespace prefixes are stripped before serde parsing so the
//! struct definitions stay simple.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

use crate::error::{TopologyError, Result};

/// Parse XML into a deserializable type, stripping namespace prefixes first.
pub fn parse<T: DeserializeOwned>(xml: &str) -> Result<T> {
    let stripped = strip_namespaces(xml);
    quick_xml::de::from_str(&stripped).map_err(|e| TopologyError::Parse(e.to_string()))
}

/// Strip namespace prefixes from tag and attribute names.
///
/// Input: `<e:propertyset><dc:title>Song</dc:title></e:propertyset>`
/// Output: `<propertyset><title>Song</title></propertyset>`
pub fn strip_namespaces(xml: &str) -> String {
    let mut result = String::with_capacity(xml.len());
    let mut chars = xml.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '<' {
            result.push(c);

            if chars.peek() == Some(&'/') {
                result.push(chars.next().unwrap());
            }

            // Declarations and comments copied verbatim
            if let Some(&next) = chars.peek() {
                if next == '?' || next == '!' {
                    for ch in chars.by_ref() {
                        result.push(ch);
                        if ch == '>' {
                            break;
                        }
                    }
                    continue;
                }
            }

            let mut tag_name = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '>' || ch == '/' {
                    break;
                }
                tag_name.push(chars.next().unwrap());
            }
            if let Some(pos) = tag_name.find(':') {
                result.push_str(&tag_name[pos + 1..]);
            } else {
                result.push_str(&tag_name);
            }

            while let Some(&ch) = chars.peek() {
                if ch == '>' {
                    result.push(chars.next().unwrap());
                    break;
                }
                if ch == '/' || ch.is_whitespace() {
                    result.push(chars.next().unwrap());
                    continue;
                }

                let mut attr_name = String::new();
                while let Some(&ach) = chars.peek() {
                    if ach == '=' || ach.is_whitespace() || ach == '>' || ach == '/' {
                        break;
                    }
                    attr_name.push(chars.next().unwrap());
                }

                if attr_name.starts_with("xmlns") {
                    // Drop xmlns declarations and their values
                    if chars.peek() == Some(&'=') {
                        chars.next();
                    }
                    if let Some(&quote) = chars.peek() {
                        if quote == '"' || quote == '\'' {
                            chars.next();
                            for ch in chars.by_ref() {
                                if ch == quote {
                                    break;
                                }
                            }
                        }
                    }
                } else {
                    if let Some(pos) = attr_name.find(':') {
                        result.push_str(&attr_name[pos + 1..]);
                    } else {
                        result.push_str(&attr_name);
                    }
                    while let Some(&ach) = chars.peek() {
                        if ach == '>' || ach == '/' {
                            break;
                        }
                        if ach == '"' || ach == '\'' {
                            let quote = chars.next().unwrap();
                            result.push(quote);
                            for ch in chars.by_ref() {
                                result.push(ch);
                                if ch == quote {
                                    break;
                                }
                            }
                            break;
                        }
                        result.push(chars.next().unwrap());
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Deserializer for elements whose text content is an XML-escaped document.
pub fn deserialize_nested<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) if !s.trim().is_empty() => {
            parse::<T>(&s).map(Some).map_err(serde::de::Error::custom)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_namespaces_basic() {
        let input = r#"<e:propertyset><e:property>test</e:property></e:propertyset>"#;
        let expected = r#"<propertyset><property>test</property></propertyset>"#;
        assert_eq!(strip_namespaces(input), expected);
    }

    #[test]
    fn test_strip_namespaces_with_attributes() {
        let input = r#"<dc:title id="1">Song</dc:title>"#;
        let expected = r#"<title id="1">Song</title>"#;
        assert_eq!(strip_namespaces(input), expected);
    }

    #[test]
    fn test_strip_namespaces_drops_xmlns() {
        let input = r#"<ZoneGroupState xmlns="urn:x"><ZoneGroups/></ZoneGroupState>"#;
        let expected = r#"<ZoneGroupState ><ZoneGroups/></ZoneGroupState>"#;
        assert_eq!(strip_namespaces(input), expected);
    }
}
