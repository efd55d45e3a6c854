use std::{cmp::Ordering, fmt};

use serde_json::Value;

use crate::store::Document;

/// Field name of the server-assigned creation timestamp.
pub const CREATED_AT: &str = "createdAt";

/// Slash-separated path of a collection, e.g. `complaints/abc/comments`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    pub fn complaints() -> Self {
        Self::new("complaints")
    }

    pub fn comments(complaint_id: &str) -> Self {
        Self(format!("complaints/{complaint_id}/comments"))
    }

    pub fn notes(complaint_id: &str) -> Self {
        Self(format!("complaints/{complaint_id}/notes"))
    }

    pub fn users() -> Self {
        Self::new("users")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentPath {
        DocumentPath {
            collection: self.clone(),
            id: id.into(),
        }
    }

    /// Document that owns this subcollection, if any.
    pub fn parent(&self) -> Option<DocumentPath> {
        let (parent, _) = self.0.rsplit_once('/')?;
        let (collection, id) = parent.rsplit_once('/')?;
        Some(CollectionPath::new(collection).doc(id))
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub collection: CollectionPath,
    pub id: String,
}

impl DocumentPath {
    pub fn complaint(id: &str) -> Self {
        CollectionPath::complaints().doc(id)
    }

    pub fn user(uid: &str) -> Self {
        CollectionPath::users().doc(uid)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Collection(CollectionPath),
    Document(DocumentPath),
}

impl Target {
    pub fn collection(&self) -> &CollectionPath {
        match self {
            Target::Collection(path) => path,
            Target::Document(doc) => &doc.collection,
        }
    }
}

/// Equality predicate on a single field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub target: Target,
    pub filter: Option<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn collection(path: CollectionPath) -> Self {
        Self {
            target: Target::Collection(path),
            filter: None,
            order: None,
        }
    }

    pub fn document(path: DocumentPath) -> Self {
        Self {
            target: Target::Document(path),
            filter: None,
            order: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = Some(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some(Order {
            field: field.into(),
            direction,
        });
        self
    }

    /// Whether a write to `collection` can change this query's result.
    pub fn watches(&self, collection: &CollectionPath) -> bool {
        self.target.collection() == collection
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Target::Document(path) = &self.target {
            if path.id != doc.id {
                return false;
            }
        }
        match &self.filter {
            Some(filter) => doc.field(&filter.field).as_ref() == Some(&filter.value),
            None => true,
        }
    }

    /// Sorts by the requested order, falling back to creation time then id.
    pub fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| {
            let primary = match &self.order {
                Some(order) => {
                    let ord = compare_field(a, b, &order.field);
                    match order.direction {
                        Direction::Ascending => ord,
                        Direction::Descending => ord.reverse(),
                    }
                }
                None => Ordering::Equal,
            };
            primary
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

fn compare_field(a: &Document, b: &Document, field: &str) -> Ordering {
    if field == CREATED_AT {
        return a.created_at.cmp(&b.created_at);
    }
    compare_values(a.field(field).as_ref(), b.field(field).as_ref())
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
