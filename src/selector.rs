//! A selector compiles to a chain of filters intersected against the
//! current candidate set, followed by a disambiguator. Spatial relations
//! and `containsChild` are the two clauses that query the live hierarchy
//! eagerly (to resolve their anchor/inner element); everything else is a
//! lazy predicate over `(hierarchy, candidates)`.

use regex_lite::RegexBuilder;

use crate::driver::{Bounds, ViewHierarchy, ViewNode};
use crate::error::DomainError;
use crate::protocol::ElementSelector;

fn compile_regex(pattern: &str) -> Result<regex_lite::Regex, DomainError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .multi_line(true)
        .build()
        .map_err(|e| DomainError::InvalidCommand(format!("invalid selector regex `{pattern}`: {e}")))
}

/// Human-readable description of a selector, used in `ElementNotFound`'s
/// `debug_hint`: one human-readable fragment per clause.
pub fn describe(selector: &ElementSelector) -> String {
    let mut parts = Vec::new();
    if let Some(t) = &selector.text_regex {
        parts.push(format!("text matches /{t}/"));
    }
    if let Some(t) = &selector.id_regex {
        parts.push(format!("id matches /{t}/"));
    }
    if let Some(s) = &selector.size {
        parts.push(format!(
            "size ~= {}x{} (±{})",
            s.width, s.height, s.tolerance
        ));
    }
    if !selector.traits.is_empty() {
        parts.push(format!("traits = {:?}", selector.traits));
    }
    for (name, value) in [
        ("enabled", selector.enabled),
        ("selected", selector.selected),
        ("checked", selector.checked),
        ("focused", selector.focused),
    ] {
        if let Some(v) = value {
            parts.push(format!("{name} = {v}"));
        }
    }
    if let Some(b) = &selector.below {
        parts.push(format!("below({})", describe(b)));
    }
    if let Some(b) = &selector.above {
        parts.push(format!("above({})", describe(b)));
    }
    if let Some(b) = &selector.left_of {
        parts.push(format!("leftOf({})", describe(b)));
    }
    if let Some(b) = &selector.right_of {
        parts.push(format!("rightOf({})", describe(b)));
    }
    if let Some(b) = &selector.child_of {
        parts.push(format!("childOf({})", describe(b)));
    }
    if let Some(b) = &selector.contains_child {
        parts.push(format!("containsChild({})", describe(b)));
    }
    for d in &selector.contains_descendants {
        parts.push(format!("containsDescendants({})", describe(d)));
    }
    if let Some(css) = &selector.css {
        parts.push(format!("css = {css}"));
    }
    if let Some(i) = selector.index {
        parts.push(format!("index = {i}"));
    }
    if parts.is_empty() {
        "(any element)".to_string()
    } else {
        parts.join(", ")
    }
}

/// Precompiled regex clauses for one selector resolution. Built once per
/// `find_all` call (and once per nested `containsDescendants` selector,
/// recursively) rather than once per candidate node — a poll loop over an
/// N-node hierarchy would otherwise rebuild the same `Regex` on every node
/// of every poll.
struct CompiledSelector<'a> {
    selector: &'a ElementSelector,
    text_re: Option<regex_lite::Regex>,
    id_re: Option<regex_lite::Regex>,
    contains_descendants: Vec<CompiledSelector<'a>>,
}

impl<'a> CompiledSelector<'a> {
    fn compile(selector: &'a ElementSelector) -> Result<Self, DomainError> {
        let text_re = selector
            .text_regex
            .as_deref()
            .map(compile_regex)
            .transpose()?;
        let id_re = selector
            .id_regex
            .as_deref()
            .map(compile_regex)
            .transpose()?;
        let contains_descendants = selector
            .contains_descendants
            .iter()
            .map(CompiledSelector::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            selector,
            text_re,
            id_re,
            contains_descendants,
        })
    }

    fn matches_text_clauses(&self, node: &ViewNode) -> bool {
        if let Some(re) = &self.text_re {
            let haystack = node
                .text
                .as_deref()
                .or(node.hint_text.as_deref())
                .or(node.accessibility_text.as_deref())
                .unwrap_or("");
            if !re.is_match(haystack) {
                return false;
            }
        }
        if let Some(re) = &self.id_re {
            if !re.is_match(node.id.as_deref().unwrap_or("")) {
                return false;
            }
        }
        if let Some(css) = &self.selector.css {
            // No live DOM engine is in scope; treat `css` as a direct
            // id-selector fallback the way a `#foo` CSS selector would
            // resolve against an element id.
            let target = css.trim_start_matches('#');
            if node.id.as_deref() != Some(target) {
                return false;
            }
        }
        true
    }

    fn matches_basic_clauses(&self, node: &ViewNode) -> bool {
        if !self.matches_text_clauses(node) {
            return false;
        }
        if let Some(size) = &self.selector.size {
            let dw = (node.bounds.width - size.width).abs();
            let dh = (node.bounds.height - size.height).abs();
            if dw > size.tolerance || dh > size.tolerance {
                return false;
            }
        }
        if !self
            .selector
            .traits
            .iter()
            .all(|t| node.traits.iter().any(|nt| nt == t))
        {
            return false;
        }
        for (expected, actual) in [
            (self.selector.enabled, node.enabled),
            (self.selector.selected, node.selected),
            (self.selector.checked, node.checked),
            (self.selector.focused, node.focused),
        ] {
            if let Some(expected) = expected {
                if expected != actual {
                    return false;
                }
            }
        }
        for nested in &self.contains_descendants {
            let found = node.iter().skip(1).any(|d| nested.matches_basic_clauses(d));
            if !found {
                return false;
            }
        }
        true
    }
}

fn relation_holds(candidate: Bounds, anchor: Bounds, relation: Relation) -> bool {
    match relation {
        Relation::Below => candidate.y >= anchor.y + anchor.height,
        Relation::Above => candidate.y + candidate.height <= anchor.y,
        Relation::LeftOf => candidate.x + candidate.width <= anchor.x,
        Relation::RightOf => candidate.x >= anchor.x + anchor.width,
    }
}

#[derive(Clone, Copy)]
enum Relation {
    Below,
    Above,
    LeftOf,
    RightOf,
}

/// Resolves `selector` against `hierarchy`, applying every clause in turn
/// and finishing with the disambiguator: `index` if present, otherwise the
/// first clickable candidate, otherwise the first candidate overall.
pub fn resolve<'a>(
    selector: &ElementSelector,
    hierarchy: &'a ViewHierarchy,
) -> Result<&'a ViewNode, DomainError> {
    let candidates = find_all(selector, hierarchy)?;
    disambiguate(candidates, selector).ok_or_else(|| not_found(selector, hierarchy))
}

/// Same as `resolve` but returns every surviving candidate, pre-disambiguation.
pub fn find_all<'a>(
    selector: &ElementSelector,
    hierarchy: &'a ViewHierarchy,
) -> Result<Vec<&'a ViewNode>, DomainError> {
    let compiled = CompiledSelector::compile(selector)?;
    let mut candidates: Vec<&ViewNode> = Vec::new();
    for n in hierarchy.all_nodes() {
        if compiled.matches_basic_clauses(n) {
            candidates.push(n);
        }
    }

    for (relation, anchor_selector) in [
        (Relation::Below, &selector.below),
        (Relation::Above, &selector.above),
        (Relation::LeftOf, &selector.left_of),
        (Relation::RightOf, &selector.right_of),
    ] {
        if let Some(anchor_selector) = anchor_selector {
            let anchor = resolve(anchor_selector, hierarchy)?;
            let anchor_bounds = anchor.bounds;
            candidates.retain(|n| relation_holds(n.bounds, anchor_bounds, relation));
        }
    }

    if let Some(parent_selector) = &selector.child_of {
        let parent = resolve(parent_selector, hierarchy)?;
        let descendants: Vec<*const ViewNode> =
            parent.iter().skip(1).map(|n| n as *const ViewNode).collect();
        candidates.retain(|n| descendants.contains(&(*n as *const ViewNode)));
    }

    if let Some(inner_selector) = &selector.contains_child {
        let inner = resolve(inner_selector, hierarchy)?;
        let inner_ptr = inner as *const ViewNode;
        candidates.retain(|n| {
            n.iter()
                .skip(1)
                .any(|d| d as *const ViewNode == inner_ptr)
        });
    }

    Ok(candidates)
}

fn disambiguate<'a>(
    candidates: Vec<&'a ViewNode>,
    selector: &ElementSelector,
) -> Option<&'a ViewNode> {
    if let Some(index) = selector.index {
        return candidates.into_iter().nth(index);
    }
    if let Some(clickable) = candidates.iter().find(|n| n.clickable) {
        return Some(*clickable);
    }
    candidates.into_iter().next()
}

fn not_found(selector: &ElementSelector, hierarchy: &ViewHierarchy) -> DomainError {
    let description = describe(selector);
    DomainError::ElementNotFound {
        description: description.clone(),
        root_snapshot: snapshot(hierarchy),
        debug_hint: format!(
            "no element matched [{description}]; check spelling/regex case, and that the view is actually on screen"
        ),
    }
}

/// Compact textual dump of a hierarchy for error payloads. Not meant to be
/// a faithful serialization — report rendering is out of scope here.
pub fn snapshot(hierarchy: &ViewHierarchy) -> String {
    hierarchy
        .all_nodes()
        .iter()
        .filter_map(|n| n.first_non_empty_text())
        .take(20)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Bounds;

    fn leaf(text: &str, bounds: Bounds, clickable: bool) -> ViewNode {
        ViewNode {
            text: Some(text.to_string()),
            bounds,
            clickable,
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn text_regex_is_case_insensitive() {
        let hierarchy = ViewHierarchy {
            root: ViewNode {
                children: vec![leaf("Sign In", Bounds::default(), true)],
                ..Default::default()
            },
        };
        let selector = ElementSelector::by_text("sign in");
        assert!(resolve(&selector, &hierarchy).is_ok());
    }

    #[test]
    fn prefers_clickable_when_no_index() {
        let hierarchy = ViewHierarchy {
            root: ViewNode {
                children: vec![
                    leaf("Item", Bounds::default(), false),
                    leaf("Item", Bounds::default(), true),
                ],
                ..Default::default()
            },
        };
        let selector = ElementSelector::by_text("Item");
        let found = resolve(&selector, &hierarchy).unwrap();
        assert!(found.clickable);
    }

    #[test]
    fn index_picks_stable_nth() {
        let hierarchy = ViewHierarchy {
            root: ViewNode {
                children: vec![
                    leaf("Item", Bounds::default(), false),
                    leaf("Item", Bounds::default(), false),
                ],
                ..Default::default()
            },
        };
        let selector = ElementSelector {
            index: Some(1),
            ..ElementSelector::by_text("Item")
        };
        let first = resolve(&ElementSelector::by_text("Item"), &hierarchy).unwrap() as *const _;
        let second = resolve(&selector, &hierarchy).unwrap() as *const _;
        assert_ne!(first, second);
    }

    #[test]
    fn below_uses_anchor_bounds() {
        let anchor_bounds = Bounds {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 20.0,
        };
        let below_bounds = Bounds {
            x: 0.0,
            y: 50.0,
            width: 100.0,
            height: 20.0,
        };
        let hierarchy = ViewHierarchy {
            root: ViewNode {
                children: vec![
                    leaf("Title", anchor_bounds, false),
                    leaf("Subtitle", below_bounds, false),
                ],
                ..Default::default()
            },
        };
        let selector = ElementSelector {
            below: Some(Box::new(ElementSelector::by_text("Title"))),
            ..Default::default()
        };
        let found = resolve(&selector, &hierarchy).unwrap();
        assert_eq!(found.text.as_deref(), Some("Subtitle"));
    }

    #[test]
    fn missing_element_reports_debug_hint() {
        let hierarchy = ViewHierarchy::default();
        let err = resolve(&ElementSelector::by_text("Nope"), &hierarchy).unwrap_err();
        match err {
            DomainError::ElementNotFound { debug_hint, .. } => {
                assert!(debug_hint.contains("Nope") || debug_hint.contains("no element matched"));
            }
            _ => panic!("expected ElementNotFound"),
        }
    }
}
