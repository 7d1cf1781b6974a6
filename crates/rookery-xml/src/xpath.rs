//! The XPath subset used for tree queries.
//!
//! Paths are `/`-separated child steps with an optional `attribute::` axis,
//! name tests (`name`, `prefix:name`, `*`, `text()`) and attribute
//! predicates (`[@attr]`, `[@attr='value']`, `[@prefix:attr]`). Prefixes are
//! resolved through an explicit prefix → IRI map supplied by the caller; the
//! empty prefix maps the default namespace for element tests and "no
//! namespace" for attribute tests.

use std::collections::HashMap;

use crate::element::{Attribute, Element, Node};

/// Prefix → namespace-IRI mapping for a query.
pub type NsMap = HashMap<String, String>;

/// One result of a query: element, character data, or attribute.
#[derive(Debug, Clone, Copy)]
pub enum Match<'a> {
    /// A matched element.
    Element(&'a Element),
    /// A matched run of character data.
    Text(&'a str),
    /// A matched attribute.
    Attribute(&'a Attribute),
}

impl<'a> Match<'a> {
    /// The matched element, if this match is one.
    pub fn as_element(&self) -> Option<&'a Element> {
        match self {
            Match::Element(el) => Some(el),
            _ => None,
        }
    }

    /// The textual value of the match: element text, text data, or
    /// attribute value.
    pub fn value(&self) -> String {
        match self {
            Match::Element(el) => el.text(),
            Match::Text(t) => (*t).to_string(),
            Match::Attribute(a) => a.value.clone(),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Axis {
    Child,
    Attribute,
}

struct Step<'p> {
    axis: Axis,
    name_test: &'p str,
    predicate: Option<&'p str>,
    rest: Option<&'p str>,
}

/// Split one step off the front of a path.
fn parse_step(path: &str) -> Option<Step<'_>> {
    let (axis, path) = if let Some(rest) = path.strip_prefix("child::") {
        (Axis::Child, rest)
    } else if let Some(rest) = path.strip_prefix("attribute::") {
        (Axis::Attribute, rest)
    } else if let Some(rest) = path.strip_prefix('@') {
        (Axis::Attribute, rest)
    } else {
        (Axis::Child, path)
    };

    let bracket = path.find('[');
    let slash = path.find('/');

    match (bracket, slash) {
        (None, None) => Some(Step {
            axis,
            name_test: path,
            predicate: None,
            rest: None,
        }),
        (None, Some(s)) => Some(Step {
            axis,
            name_test: &path[..s],
            predicate: None,
            rest: Some(&path[s + 1..]),
        }),
        (Some(b), s) => {
            // A '/' before the '[' ends the step without a predicate.
            if let Some(s) = s {
                if s < b {
                    return Some(Step {
                        axis,
                        name_test: &path[..s],
                        predicate: None,
                        rest: Some(&path[s + 1..]),
                    });
                }
            }
            let close = path[b..].find(']').map(|i| b + i)?;
            let rest = path[close..].find('/').map(|i| &path[close + i + 1..]);
            Some(Step {
                axis,
                name_test: &path[..b],
                predicate: Some(&path[b + 1..close]),
                rest,
            })
        }
    }
}

/// Resolve a possibly prefixed name test against the namespace map.
///
/// Returns `(local_name, iri)`. The IRI is `None` when the (empty) prefix has
/// no mapping, which matches only attributes without a namespace.
fn resolve<'p>(test: &'p str, namespaces: &'p NsMap, default_for_elements: bool) -> (&'p str, Option<&'p str>) {
    match test.split_once(':') {
        Some((prefix, local)) => (local, namespaces.get(prefix).map(String::as_str)),
        None => {
            let iri = if default_for_elements {
                namespaces.get("").map(String::as_str)
            } else {
                None
            };
            (test, iri)
        }
    }
}

/// Evaluate an attribute predicate against an element.
fn predicate_matches(el: &Element, predicate: &str, namespaces: &NsMap) -> bool {
    let Some(predicate) = predicate.strip_prefix('@') else {
        // Only attribute predicates are supported.
        return false;
    };

    let (name_part, wanted_value) = match predicate.split_once('=') {
        Some((n, v)) => {
            let v = v
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| v.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .unwrap_or(v);
            (n, Some(v))
        }
        None => (predicate, None),
    };

    let (local, iri) = resolve(name_part, namespaces, false);
    let value = match iri {
        Some(iri) => el.attr_ns(local, iri),
        None => el.attr(local),
    };

    match (value, wanted_value) {
        (Some(actual), Some(wanted)) => actual == wanted,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn step_matches_element(el: &Element, step: &Step<'_>, namespaces: &NsMap) -> bool {
    if step.name_test == "text()" {
        return false;
    }
    if step.name_test == "*" {
        // A prefixed wildcard restricts the namespace.
        return true;
    }
    if let Some((prefix, _)) = step.name_test.split_once(':') {
        if step.name_test.ends_with('*') {
            return namespaces.get(prefix).map(String::as_str) == Some(el.ns());
        }
    }
    let (local, iri) = resolve(step.name_test, namespaces, true);
    local == el.name() && iri == Some(el.ns())
}

fn collect<'a>(
    context: &'a Element,
    path: &str,
    namespaces: &NsMap,
    out: &mut Vec<Match<'a>>,
) {
    let Some(step) = parse_step(path) else {
        return;
    };

    match step.axis {
        Axis::Attribute => {
            let (local, iri) = resolve(step.name_test, namespaces, false);
            for attr in context.attrs() {
                let name_ok = step.name_test == "*" || attr.name == local;
                let ns_ok =
                    step.name_test == "*" || attr.ns.as_deref() == iri;
                if name_ok && ns_ok {
                    out.push(Match::Attribute(attr));
                }
            }
        }
        Axis::Child => {
            for node in context.nodes() {
                match node {
                    Node::Text(t) => {
                        if step.name_test == "text()" && step.rest.is_none() {
                            out.push(Match::Text(t.as_str()));
                        }
                    }
                    Node::Element(el) => {
                        let name_ok = if step.name_test == "*" {
                            true
                        } else if step.name_test.contains(':')
                            && step.name_test.ends_with(":*")
                        {
                            let prefix = step.name_test.trim_end_matches(":*");
                            namespaces.get(prefix).map(String::as_str) == Some(el.ns())
                        } else {
                            let (local, iri) = resolve(step.name_test, namespaces, true);
                            local == el.name() && iri == Some(el.ns())
                        };
                        if !name_ok {
                            continue;
                        }
                        if let Some(pred) = step.predicate {
                            if !predicate_matches(el, pred, namespaces) {
                                continue;
                            }
                        }
                        match step.rest {
                            None => out.push(Match::Element(el)),
                            Some(rest) => collect(el, rest, namespaces, out),
                        }
                    }
                }
            }
        }
    }
}

/// Query the subtree under `context` with an XPath-subset expression.
///
/// Results are in document order. An empty or unparseable path yields no
/// results.
pub fn get_tags<'a>(context: &'a Element, path: &str, namespaces: &NsMap) -> Vec<Match<'a>> {
    let mut out = Vec::new();
    if !path.is_empty() {
        collect(context, path, namespaces, &mut out);
    }
    out
}

/// Positional selection from a match list (the wrapper form of indexing).
pub fn get_list_item<'a>(matches: &[Match<'a>], index: usize) -> Option<Match<'a>> {
    matches.get(index).copied()
}

/// Indices (into `parent`'s node list) of direct child elements selected by
/// the first step of `path`, where any remaining steps also match within the
/// child. Used to delete the matched subset on xdb inserts.
pub fn match_children(parent: &Element, path: &str, namespaces: &NsMap) -> Vec<usize> {
    let Some(step) = parse_step(path) else {
        return Vec::new();
    };
    if step.axis != Axis::Child {
        return Vec::new();
    }

    let mut out = Vec::new();
    for (idx, node) in parent.nodes().iter().enumerate() {
        let Node::Element(el) = node else { continue };
        if !step_matches_element(el, &step, namespaces) {
            continue;
        }
        if let Some(pred) = step.predicate {
            if !predicate_matches(el, pred, namespaces) {
                continue;
            }
        }
        if let Some(rest) = step.rest {
            if get_tags(el, rest, namespaces).is_empty() {
                continue;
            }
        }
        out.push(idx);
    }
    out
}

/// Whether a single element satisfies the first step of `path` (name test
/// plus predicate), with any remaining steps matching inside it.
pub fn element_matches(el: &Element, path: &str, namespaces: &NsMap) -> bool {
    let Some(step) = parse_step(path) else {
        return false;
    };
    if step.axis != Axis::Child {
        return false;
    }
    if !step_matches_element(el, &step, namespaces) {
        return false;
    }
    if let Some(pred) = step.predicate {
        if !predicate_matches(el, pred, namespaces) {
            return false;
        }
    }
    match step.rest {
        None => true,
        Some(rest) => !get_tags(el, rest, namespaces).is_empty(),
    }
}

/// Pick the best element from `candidates` for the given language.
///
/// Preference order: exact `xml:lang` match, the general language (the part
/// before `-`), an element without a language, then the first candidate.
pub fn select_by_lang<'a>(candidates: &[&'a Element], lang: Option<&str>) -> Option<&'a Element> {
    if candidates.is_empty() {
        return None;
    }

    let general = lang.and_then(|l| l.split('-').next());

    let mut first_general: Option<&'a Element> = None;
    let mut first_without: Option<&'a Element> = None;

    for el in candidates.iter().copied() {
        let el_lang = el.lang();
        if let Some(wanted) = lang {
            if let Some(l) = el_lang {
                if l.eq_ignore_ascii_case(wanted) {
                    return Some(el);
                }
                if first_general.is_none()
                    && general.is_some_and(|g| l.eq_ignore_ascii_case(g))
                {
                    first_general = Some(el);
                }
            }
        }
        if el_lang.is_none() && first_without.is_none() {
            first_without = Some(el);
        }
    }

    first_general
        .or(first_without)
        .or_else(|| candidates.first().copied())
}
