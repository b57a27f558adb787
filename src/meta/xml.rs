//! Text escaping for capability document fragments. Escaped text never
//! contains markup or line breaks, so documents stay one element per line.

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`]. Unknown entities are kept as they are.
pub fn unescape(text: &str) -> String {
    const ENTITIES: [(&str, char); 7] = [
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&apos;", '\''),
        ("&#10;", '\n'),
        ("&#13;", '\r'),
    ];

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match ENTITIES.iter().find(|(entity, _)| rest.starts_with(entity)) {
            Some((entity, c)) => {
                out.push(*c);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape("Roads & Rivers <v2>\n\"main\""),
            "Roads &amp; Rivers &lt;v2&gt;&#10;&quot;main&quot;"
        );
        assert_eq!(escape("WebMercator"), "WebMercator");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a &amp;lt; b"), "a &lt; b");
        assert_eq!(unescape("&lt;/Layer&gt;&#10;"), "</Layer>\n");
        assert_eq!(unescape("AT&T &nbsp;"), "AT&T &nbsp;");
        assert_eq!(unescape(&escape("it's <x> & \"y\"")), "it's <x> & \"y\"");
    }
}
