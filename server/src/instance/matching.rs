//! Filter matching — pure functions, no actor state.

use crate::event::{Event, Filter};

pub fn filter_matches(filter: &Filter, event: &Event) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.contains(&event.id) {
            return false;
        }
    }
    if let Some(authors) = &filter.authors {
        if !authors.contains(&event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.created_at > until {
            return false;
        }
    }
    for (letter, values) in &filter.tag_constraints {
        let has_match = event.indexed_tag_values(letter).any(|v| values.contains(v));
        if !has_match {
            return false;
        }
    }
    true
}

/// Disjunction over a filter list: matches if any filter matches.
pub fn filter_list_matches(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| filter_matches(f, event))
}
