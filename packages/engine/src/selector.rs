//! CSS selector subset for the in-memory document
//!
//! Browsers evaluate selectors natively; the in-memory [`Document`] needs its
//! own matcher. Supported grammar:
//!
//! | Form            | Example                      |
//! |-----------------|------------------------------|
//! | type / universal| `img`, `*`                   |
//! | class           | `.lazy-image`                |
//! | id              | `#hero`                      |
//! | attribute       | `[data-src]`, `[alt="x"]`    |
//! | descendant      | `main img`                   |
//! | child           | `picture > source`           |
//! | group           | `img.lazy-image, picture`    |
//!
//! Pseudo-classes, sibling combinators and attribute operators other than
//! `=` are rejected with [`RevealError::InvalidSelector`].
//!
//! [`Document`]: crate::dom::Document

use crate::config;
use crate::error::{RevealError, Result};
use crate::types::NodeId;
use std::iter::Peekable;
use std::str::Chars;

/// Read-only view of an element tree that selectors can be matched against.
pub trait SelectorTree {
    /// Tag name of an element node, `None` for non-elements.
    fn tag(&self, node: NodeId) -> Option<&str>;

    /// Attribute value of an element node.
    fn attr(&self, node: NodeId, name: &str) -> Option<&str>;

    /// Nearest ancestor that is an element.
    fn parent_of(&self, node: NodeId) -> Option<NodeId>;
}

/// A parsed, comma-separated selector group.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorList {
    selectors: Vec<ComplexSelector>,
}

#[derive(Debug, Clone, PartialEq)]
struct ComplexSelector {
    /// Left to right; `combinators[i]` joins `compounds[i]` and `compounds[i + 1]`
    compounds: Vec<Compound>,
    combinators: Vec<Combinator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeSelector>,
}

#[derive(Debug, Clone, PartialEq)]
struct AttributeSelector {
    name: String,
    value: Option<String>,
}

impl SelectorList {
    /// Parse a selector group.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser {
            source: input,
            chars: input.chars().peekable(),
        };
        let mut selectors = vec![parser.complex()?];
        loop {
            parser.skip_whitespace();
            match parser.chars.next() {
                None => break,
                Some(',') => selectors.push(parser.complex()?),
                Some(c) => return Err(parser.error(format!("unexpected '{c}'"))),
            }
        }
        Ok(Self { selectors })
    }

    /// Check whether `node` matches any selector in the group.
    pub fn matches(&self, tree: &impl SelectorTree, node: NodeId) -> bool {
        tree.tag(node).is_some()
            && self
                .selectors
                .iter()
                .any(|s| s.matches_at(tree, node, s.compounds.len() - 1))
    }
}

impl ComplexSelector {
    fn matches_at(&self, tree: &impl SelectorTree, node: NodeId, index: usize) -> bool {
        if !self.compounds[index].matches(tree, node) {
            return false;
        }
        if index == 0 {
            return true;
        }
        match self.combinators[index - 1] {
            Combinator::Child => tree
                .parent_of(node)
                .is_some_and(|parent| self.matches_at(tree, parent, index - 1)),
            Combinator::Descendant => {
                let mut ancestor = tree.parent_of(node);
                while let Some(current) = ancestor {
                    if self.matches_at(tree, current, index - 1) {
                        return true;
                    }
                    ancestor = tree.parent_of(current);
                }
                false
            }
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.ids.is_empty()
            && self.classes.is_empty()
            && self.attributes.is_empty()
    }

    fn matches(&self, tree: &impl SelectorTree, node: NodeId) -> bool {
        let Some(tag) = tree.tag(node) else {
            return false;
        };
        if let Some(expected) = &self.tag {
            if expected != "*" && !expected.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if !self
            .ids
            .iter()
            .all(|id| tree.attr(node, "id") == Some(id.as_str()))
        {
            return false;
        }
        if !self.classes.is_empty() {
            let class_attr = tree.attr(node, "class").unwrap_or_default();
            if !self
                .classes
                .iter()
                .all(|class| class_attr.split_ascii_whitespace().any(|c| c == class))
            {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|attribute| match (&attribute.value, tree.attr(node, &attribute.name)) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(expected), Some(actual)) => expected == actual,
            })
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> RevealError {
        RevealError::invalid_selector(self.source, reason)
    }

    fn skip_whitespace(&mut self) -> bool {
        let mut skipped = false;
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {
            skipped = true;
        }
        skipped
    }

    fn complex(&mut self) -> Result<ComplexSelector> {
        self.skip_whitespace();
        let mut compounds = vec![self.compound()?];
        let mut combinators = Vec::new();
        loop {
            let had_space = self.skip_whitespace();
            let combinator = match self.chars.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.chars.next();
                    self.skip_whitespace();
                    Combinator::Child
                }
                Some(_) if had_space => Combinator::Descendant,
                Some(&c) => return Err(self.error(format!("unexpected '{c}'"))),
            };
            if compounds.len() >= config::MAX_SELECTOR_DEPTH {
                return Err(self.error(format!(
                    "more than {} compound selectors",
                    config::MAX_SELECTOR_DEPTH
                )));
            }
            combinators.push(combinator);
            compounds.push(self.compound()?);
        }
        Ok(ComplexSelector {
            compounds,
            combinators,
        })
    }

    fn compound(&mut self) -> Result<Compound> {
        let mut compound = Compound::default();
        if self.chars.next_if_eq(&'*').is_some() {
            compound.tag = Some("*".to_string());
        } else if self.chars.peek().is_some_and(|c| is_ident_char(*c)) {
            compound.tag = Some(self.ident()?.to_ascii_lowercase());
        }
        loop {
            match self.chars.peek() {
                Some('.') => {
                    self.chars.next();
                    compound.classes.push(self.ident()?);
                }
                Some('#') => {
                    self.chars.next();
                    compound.ids.push(self.ident()?);
                }
                Some('[') => {
                    self.chars.next();
                    compound.attributes.push(self.attribute()?);
                }
                Some(':') => return Err(self.error("pseudo-classes are not supported")),
                Some(&(c @ ('+' | '~'))) => {
                    return Err(self.error(format!("combinator '{c}' is not supported")))
                }
                _ => break,
            }
        }
        if compound.is_empty() {
            return Err(self.error("expected a selector"));
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<AttributeSelector> {
        self.skip_whitespace();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_whitespace();
        let value = match self.chars.next() {
            Some(']') => return Ok(AttributeSelector { name, value: None }),
            Some('=') => {
                self.skip_whitespace();
                match self.chars.peek() {
                    Some(quote @ ('"' | '\'')) => {
                        let quote = *quote;
                        self.chars.next();
                        let mut value = String::new();
                        loop {
                            match self.chars.next() {
                                Some(c) if c == quote => break,
                                Some(c) => value.push(c),
                                None => return Err(self.error("unterminated string")),
                            }
                        }
                        value
                    }
                    _ => self.ident()?,
                }
            }
            Some(c) => return Err(self.error(format!("unsupported attribute operator '{c}'"))),
            None => return Err(self.error("unterminated attribute selector")),
        };
        self.skip_whitespace();
        match self.chars.next() {
            Some(']') => Ok(AttributeSelector {
                name,
                value: Some(value),
            }),
            _ => Err(self.error("unterminated attribute selector")),
        }
    }

    fn ident(&mut self) -> Result<String> {
        let mut ident = String::new();
        while let Some(c) = self.chars.next_if(|c| is_ident_char(*c)) {
            ident.push(c);
        }
        if ident.is_empty() {
            return Err(self.error("expected an identifier"));
        }
        Ok(ident)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}
