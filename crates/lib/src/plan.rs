//! The matched physical plan: an operator tree annotated with schemas.
//!
//! Plans arrive fully optimized; the backend only walks them. Sinks sit at
//! the root (print, callback, or no-op), producers at the leaves, and every
//! other operator consumes exactly the children the optimizer gave it.

use crate::expr::{Cnf, Expr};
use crate::schema::{Schema, SchemaEntry};
use crate::store::RowStore;
use crate::tuple::Tuple;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Shared byte sink of a print or no-op root.
pub type PrintSink = Arc<Mutex<dyn Write + Send>>;

/// Per-row callback of a callback root.
pub type TupleCallback = Arc<Mutex<dyn FnMut(&Schema, &Tuple) + Send>>;

pub struct ScanOp {
    pub store: Arc<RowStore>,
    pub alias: String,
    pub schema: Schema,
}

pub struct FilterOp {
    pub filter: Cnf,
    pub child: Box<Operator>,
    pub schema: Schema,
}

/// A filter consisting of a single disjunction of predicates.
pub struct DisjunctiveFilterOp {
    pub filter: Cnf,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct JoinOp {
    pub predicate: Cnf,
    pub children: Vec<Operator>,
    pub schema: Schema,
}

pub struct ProjectionOp {
    /// Projected expressions with optional aliases, in output order.
    pub projections: Vec<(Expr, Option<String>)>,
    pub child: Option<Box<Operator>>,
    pub schema: Schema,
}

pub struct LimitOp {
    pub limit: usize,
    pub offset: usize,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct GroupingOp {
    pub group_by: Vec<(Expr, Option<String>)>,
    pub aggregates: Vec<Expr>,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct AggregationOp {
    pub aggregates: Vec<Expr>,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct SortingOp {
    /// Sort keys with an ascending flag.
    pub order_by: Vec<(Expr, bool)>,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct PrintOp {
    pub out: PrintSink,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct CallbackOp {
    pub callback: TupleCallback,
    pub child: Box<Operator>,
    pub schema: Schema,
}

pub struct NoOpOp {
    pub out: PrintSink,
    pub child: Box<Operator>,
    pub schema: Schema,
}

/// One node of the matched physical plan.
pub enum Operator {
    Scan(ScanOp),
    Callback(CallbackOp),
    Print(PrintOp),
    NoOp(NoOpOp),
    Filter(FilterOp),
    DisjunctiveFilter(DisjunctiveFilterOp),
    Join(JoinOp),
    Projection(ProjectionOp),
    Limit(LimitOp),
    Grouping(GroupingOp),
    Aggregation(AggregationOp),
    Sorting(SortingOp),
}

impl Operator {
    pub fn schema(&self) -> &Schema {
        match self {
            Operator::Scan(op) => &op.schema,
            Operator::Callback(op) => &op.schema,
            Operator::Print(op) => &op.schema,
            Operator::NoOp(op) => &op.schema,
            Operator::Filter(op) => &op.schema,
            Operator::DisjunctiveFilter(op) => &op.schema,
            Operator::Join(op) => &op.schema,
            Operator::Projection(op) => &op.schema,
            Operator::Limit(op) => &op.schema,
            Operator::Grouping(op) => &op.schema,
            Operator::Aggregation(op) => &op.schema,
            Operator::Sorting(op) => &op.schema,
        }
    }

    pub fn children(&self) -> Vec<&Operator> {
        match self {
            Operator::Scan(_) => Vec::new(),
            Operator::Callback(op) => vec![&op.child],
            Operator::Print(op) => vec![&op.child],
            Operator::NoOp(op) => vec![&op.child],
            Operator::Filter(op) => vec![&op.child],
            Operator::DisjunctiveFilter(op) => vec![&op.child],
            Operator::Join(op) => op.children.iter().collect(),
            Operator::Projection(op) => op.child.iter().map(|c| c.as_ref()).collect(),
            Operator::Limit(op) => vec![&op.child],
            Operator::Grouping(op) => vec![&op.child],
            Operator::Aggregation(op) => vec![&op.child],
            Operator::Sorting(op) => vec![&op.child],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Scan(_) => "Scan",
            Operator::Callback(_) => "Callback",
            Operator::Print(_) => "Print",
            Operator::NoOp(_) => "NoOp",
            Operator::Filter(_) => "Filter",
            Operator::DisjunctiveFilter(_) => "DisjunctiveFilter",
            Operator::Join(_) => "Join",
            Operator::Projection(_) => "Projection",
            Operator::Limit(_) => "Limit",
            Operator::Grouping(_) => "Grouping",
            Operator::Aggregation(_) => "Aggregation",
            Operator::Sorting(_) => "Sorting",
        }
    }

    /// A scan of `store` under `alias`, qualifying every column id.
    pub fn scan(store: Arc<RowStore>, alias: impl Into<String>) -> Operator {
        let alias = alias.into();
        let schema = Schema::new(
            store
                .table()
                .columns
                .iter()
                .map(|c| SchemaEntry::new(format!("{alias}.{}", c.name), c.ty))
                .collect(),
        );
        Operator::Scan(ScanOp {
            store,
            alias,
            schema,
        })
    }

    pub fn filter(self, filter: Cnf) -> Operator {
        let schema = self.schema().clone();
        Operator::Filter(FilterOp {
            filter,
            child: Box::new(self),
            schema,
        })
    }

    pub fn disjunctive_filter(self, filter: Cnf) -> Operator {
        let schema = self.schema().clone();
        Operator::DisjunctiveFilter(DisjunctiveFilterOp {
            filter,
            child: Box::new(self),
            schema,
        })
    }

    /// Projects `projections` over `self`. Identifiers come from the alias
    /// when given, from the column for designators, and are synthesized for
    /// anything else; constant expressions mark their entry constant.
    pub fn project(self, projections: Vec<(Expr, Option<String>)>) -> Operator {
        let schema = projection_schema(&projections);
        Operator::Projection(ProjectionOp {
            projections,
            child: Some(Box::new(self)),
            schema,
        })
    }

    pub fn limit(self, limit: usize, offset: usize) -> Operator {
        let schema = self.schema().clone();
        Operator::Limit(LimitOp {
            limit,
            offset,
            child: Box::new(self),
            schema,
        })
    }

    pub fn print(self, out: PrintSink) -> Operator {
        let schema = self.schema().clone();
        Operator::Print(PrintOp {
            out,
            child: Box::new(self),
            schema,
        })
    }

    pub fn callback(self, callback: TupleCallback) -> Operator {
        let schema = self.schema().clone();
        Operator::Callback(CallbackOp {
            callback,
            child: Box::new(self),
            schema,
        })
    }

    pub fn no_op(self, out: PrintSink) -> Operator {
        let schema = self.schema().clone();
        Operator::NoOp(NoOpOp {
            out,
            child: Box::new(self),
            schema,
        })
    }
}

fn projection_schema(projections: &[(Expr, Option<String>)]) -> Schema {
    let mut schema = Schema::default();
    for (i, (expr, alias)) in projections.iter().enumerate() {
        let id = match (alias, expr) {
            (Some(alias), _) => alias.clone(),
            (None, Expr::Column { id, .. }) => id.clone(),
            (None, e) if e.is_constant() => format!("$const{i}"),
            (None, _) => format!("$expr{i}"),
        };
        let entry = if expr.is_constant() {
            SchemaEntry::constant(id, expr.ty())
        } else {
            SchemaEntry::new(id, expr.ty())
        };
        schema.push(entry);
    }
    schema
}

/// The matched physical plan handed to the backend by the optimizer.
pub struct PhysicalPlan {
    root: Operator,
}

impl PhysicalPlan {
    pub fn new(root: Operator) -> Self {
        PhysicalPlan { root }
    }

    /// The root operator of the matched plan.
    pub fn matched_root(&self) -> &Operator {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Column, Table};
    use crate::types::Type;

    fn scan() -> Operator {
        let table = Arc::new(Table::new(
            "t",
            vec![Column::new("id", Type::I32), Column::new("name", Type::Char(8))],
        ));
        Operator::scan(Arc::new(RowStore::new(table)), "t")
    }

    #[test]
    fn scan_qualifies_identifiers() {
        let op = scan();
        assert_eq!(op.schema()[0].id, "t.id");
        assert_eq!(op.schema()[1].id, "t.name");
    }

    #[test]
    fn projection_marks_constants() {
        let op = scan().project(vec![
            (Expr::column("t.id", Type::I32), None),
            (Expr::int(1), None),
            (Expr::null(), None),
        ]);
        let schema = op.schema();
        assert!(!schema[0].constant);
        assert!(schema[1].constant);
        assert!(schema[2].constant);
        assert_eq!(schema[0].id, "t.id");
        assert_eq!(schema[1].id, "$const1");
    }

    #[test]
    fn sink_roots_copy_child_schema() {
        let sink: PrintSink = Arc::new(Mutex::new(Vec::new()));
        let op = scan().print(sink);
        assert_eq!(op.schema().num_entries(), 2);
        assert_eq!(op.children().len(), 1);
    }
}
