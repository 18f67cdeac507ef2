// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal XML element tree, enough to emit libvirt definitions.

use std::borrow::Cow;
use std::fmt::Write;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Content {
    Element(Element),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    name: &'static str,
    attrs: Vec<(&'static str, String)>,
    content: Vec<Content>,
}

impl Element {
    pub fn new(name: &'static str) -> Self {
        Self { name, attrs: Vec::new(), content: Vec::new() }
    }

    pub fn attr(mut self, key: &'static str, value: impl ToString) -> Self {
        self.attrs.push((key, value.to_string()));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.content.push(Content::Element(child));
        self
    }

    pub fn maybe_child(self, child: Option<Element>) -> Self {
        match child {
            Some(c) => self.child(c),
            None => self,
        }
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.content.extend(children.into_iter().map(Content::Element));
        self
    }

    pub fn text(mut self, text: impl ToString) -> Self {
        self.content.push(Content::Text(text.to_string()));
        self
    }

    /// Convenience for `<name>text</name>`.
    pub fn leaf(name: &'static str, text: impl ToString) -> Self {
        Self::new(name).text(text)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = write!(out, "{indent}<{}", self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {k}=\"{}\"", escape(v));
        }
        match self.content.as_slice() {
            [] => out.push_str("/>\n"),
            [Content::Text(t)] => {
                let _ = writeln!(out, ">{}</{}>", escape(t), self.name);
            }
            content => {
                out.push_str(">\n");
                for c in content {
                    match c {
                        Content::Element(e) => e.render_into(out, depth + 1),
                        Content::Text(t) => {
                            let _ = writeln!(out, "{indent}  {}", escape(t));
                        }
                    }
                }
                let _ = writeln!(out, "{indent}</{}>", self.name);
            }
        }
    }
}

pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nested_rendering() {
        let doc = Element::new("network")
            .child(Element::leaf("name", "lab_test"))
            .child(Element::new("bridge").attr("stp", "off").attr("delay", 0))
            .render();
        assert_eq!(
            doc,
            "<network>\n  <name>lab_test</name>\n  <bridge stp=\"off\" delay=\"0\"/>\n</network>\n"
        );
    }

    #[test]
    fn values_are_escaped() {
        let doc = Element::new("cmdline")
            .attr("note", "a \"quoted\" <value>")
            .text("console=ttyS0 & quiet")
            .render();
        assert_eq!(
            doc,
            "<cmdline note=\"a &quot;quoted&quot; &lt;value&gt;\">console=ttyS0 &amp; quiet</cmdline>\n"
        );
        assert!(matches!(escape("plain"), Cow::Borrowed(_)));
    }
}
