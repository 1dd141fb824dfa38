//! `select=` parsing
//!
//! A single pass over the characters, tracking parenthesis depth. When a `(`
//! opens at the top level, the name before it decides the state: an
//! aggregate function name switches to `InAggregation`, anything else to
//! `InRelation`. Malformed nesting is tolerated: stray `)` are ignored and an
//! unterminated item is dropped.

use tracing::debug;

use crate::types::{AggregateFunction, Aggregation, EmbeddedRelation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Field,
    InRelation,
    InAggregation,
}

/// Result of parsing one `select` value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectClause {
    pub columns: Vec<String>,
    pub embedded: Vec<EmbeddedRelation>,
    pub aggregations: Vec<Aggregation>,
}

impl SelectClause {
    fn push_field(&mut self, token: &str) {
        let field = token.trim();
        if !field.is_empty() {
            self.columns.push(field.to_string());
        }
    }

    fn push_aggregation(&mut self, head: &str, inner: &str) {
        let (alias, name) = split_alias(head);
        let Some(function) = AggregateFunction::from_name(name) else {
            return;
        };
        let column = inner.trim();

        let aggregation = match function {
            AggregateFunction::Count if column.is_empty() || column == "*" => {
                Aggregation::count_star()
            }
            _ if column.is_empty() || column == "*" => return,
            _ => Aggregation::new(function, column),
        };

        self.aggregations.push(match alias {
            Some(alias) => aggregation.with_alias(alias),
            None => aggregation,
        });
    }

    /// Embedded relation; aggregates inside it (`posts(count())`) are dropped,
    /// an embedded relation only carries plain columns and nested relations
    fn push_relation(&mut self, head: &str, inner: &str) {
        let (_, name) = split_alias(head);
        if name.is_empty() {
            return;
        }
        let nested = parse_select(inner);
        if !nested.aggregations.is_empty() {
            debug!(
                relation = %name,
                dropped = nested.aggregations.len(),
                "dropping aggregates inside embedded relation"
            );
        }
        self.embedded.push(EmbeddedRelation {
            name: name.to_string(),
            select: nested.columns,
            filters: Vec::new(),
            embedded: nested.embedded,
        });
    }
}

/// `alias:name` -> (Some(alias), name)
pub(crate) fn split_alias(head: &str) -> (Option<&str>, &str) {
    let head = head.trim();
    match head.split_once(':') {
        Some((alias, name)) if !name.starts_with(':') => {
            let alias = alias.trim();
            ((!alias.is_empty()).then_some(alias), name.trim())
        }
        _ => (None, head),
    }
}

/// Parse a `select` value into columns, embedded relations and aggregates
///
/// # Example
/// ```
/// use runtara_data_api::params::parse_select;
///
/// let clause = parse_select("id,name,author(id,name),count(*)");
/// assert_eq!(clause.columns, vec!["id", "name"]);
/// assert_eq!(clause.embedded[0].name, "author");
/// assert_eq!(clause.aggregations[0].alias, "count");
/// ```
pub fn parse_select(input: &str) -> SelectClause {
    let mut clause = SelectClause::default();
    let mut state = State::Field;
    let mut depth = 0usize;
    let mut head = String::new();
    let mut inner = String::new();
    // set after a closing paren until the next top-level comma
    let mut closed = false;

    for c in input.chars() {
        match state {
            State::Field => match c {
                ',' => {
                    if !closed {
                        clause.push_field(&head);
                    }
                    head.clear();
                    closed = false;
                }
                _ if closed => {}
                '(' => {
                    let (_, name) = split_alias(&head);
                    state = if AggregateFunction::from_name(name).is_some() {
                        State::InAggregation
                    } else {
                        State::InRelation
                    };
                    depth = 1;
                }
                ')' => {}
                _ => head.push(c),
            },
            State::InRelation | State::InAggregation => match c {
                '(' => {
                    depth += 1;
                    inner.push(c);
                }
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        if state == State::InAggregation {
                            clause.push_aggregation(&head, &inner);
                        } else {
                            clause.push_relation(&head, &inner);
                        }
                        head.clear();
                        inner.clear();
                        closed = true;
                        state = State::Field;
                    } else {
                        inner.push(c);
                    }
                }
                _ => inner.push(c),
            },
        }
    }

    if state == State::Field && !closed {
        clause.push_field(&head);
    }

    clause
}
