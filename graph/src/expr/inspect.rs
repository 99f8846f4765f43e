//! Inspect walks a parsed expression and reports what it touches.

use std::collections::HashSet;

use cel_parser::{Expression, Member};

/// Dependency is a reference to a known resource, with the dotted access
/// path actually used (`order.items`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// The referenced resource id.
    pub id: String,
    /// The dotted access path rooted at the id; indices are elided.
    pub path: String,
}

/// Inspection is everything a single expression references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inspection {
    /// Known resources the expression reads.
    pub dependencies: Vec<Dependency>,
    /// Function calls, target-qualified where the target is a plain access
    /// path.
    pub function_calls: Vec<String>,
    /// Identifiers matching no known resource and no loop variable.
    pub unknown: Vec<String>,
}

// Receiver-style macros that bind their first argument as a loop variable.
const COMPREHENSIONS: &[&str] = &["all", "exists", "exists_one", "filter", "map"];

/// Inspect reports the resource references, function calls, and unknown
/// identifiers of `expression`, given the universe of known resource ids.
pub fn inspect(expression: &Expression, known: &HashSet<String>) -> Inspection {
    let mut walker = Walker {
        known,
        scopes: Vec::new(),
        out: Inspection::default(),
    };
    walker.visit(expression);
    walker.out
}

struct Walker<'a> {
    known: &'a HashSet<String>,
    scopes: Vec<String>,
    out: Inspection,
}

impl Walker<'_> {
    fn visit(&mut self, expression: &Expression) {
        match expression {
            Expression::Atom(_) => {}
            Expression::Ident(name) => self.root(name, name.to_string()),
            Expression::Member(..) => self.member(expression),
            Expression::FunctionCall(func, receiver, args) => {
                self.call(func, receiver.as_deref(), args)
            }
            Expression::Arithmetic(lhs, _, rhs) | Expression::Relation(lhs, _, rhs) => {
                self.visit(lhs);
                self.visit(rhs);
            }
            Expression::Or(lhs, rhs) | Expression::And(lhs, rhs) => {
                self.visit(lhs);
                self.visit(rhs);
            }
            Expression::Ternary(cond, then, alt) => {
                self.visit(cond);
                self.visit(then);
                self.visit(alt);
            }
            Expression::Unary(_, inner) => self.visit(inner),
            Expression::List(items) => items.iter().for_each(|item| self.visit(item)),
            Expression::Map(entries) => {
                for (key, value) in entries {
                    self.visit(key);
                    self.visit(value);
                }
            }
        }
    }

    // An access chain rooted at an identifier is one reference; anything
    // else decomposes into ordinary sub-expressions.
    fn member(&mut self, expression: &Expression) {
        if let Some((root, path)) = flatten(expression) {
            self.root(&root, path);
            self.index_arguments(expression);
            return;
        }
        if let Expression::Member(parent, member) = expression {
            self.visit(parent);
            match member.as_ref() {
                Member::Index(index) => self.visit(index),
                Member::Attribute(_) => {}
                Member::Fields(fields) => {
                    fields.iter().for_each(|(_, value)| self.visit(value))
                }
            }
        }
    }

    fn call(
        &mut self,
        func: &Expression,
        receiver: Option<&Expression>,
        args: &[Expression],
    ) {
        let name = match func {
            Expression::Ident(name) => name.to_string(),
            other => {
                // Computed call targets decompose like any expression.
                self.visit(other);
                for arg in args {
                    self.visit(arg);
                }
                return;
            }
        };

        match receiver {
            Some(recv) => {
                let comprehension = COMPREHENSIONS.contains(&name.as_str());
                if !comprehension {
                    let qualified = flatten(recv)
                        .map(|(_, path)| format!("{path}.{name}"))
                        .unwrap_or_else(|| name.clone());
                    self.out.function_calls.push(qualified);
                }
                self.visit(recv);
                if comprehension {
                    if let Some(Expression::Ident(var)) = args.first() {
                        self.scopes.push(var.to_string());
                        for arg in &args[1..] {
                            self.visit(arg);
                        }
                        self.scopes.pop();
                        return;
                    }
                }
                for arg in args {
                    self.visit(arg);
                }
            }
            None => {
                self.out.function_calls.push(name);
                for arg in args {
                    self.visit(arg);
                }
            }
        }
    }

    fn root(&mut self, name: &str, path: String) {
        if self.scopes.iter().any(|scope| scope == name) {
            return;
        }
        if self.known.contains(name) {
            let dep = Dependency {
                id: name.to_string(),
                path,
            };
            if !self.out.dependencies.contains(&dep) {
                self.out.dependencies.push(dep);
            }
        } else if !self.out.unknown.iter().any(|u| u == name) {
            self.out.unknown.push(name.to_string());
        }
    }

    // Index expressions inside an access chain may themselves reference
    // resources.
    fn index_arguments(&mut self, expression: &Expression) {
        if let Expression::Member(parent, member) = expression {
            if let Member::Index(index) = member.as_ref() {
                self.visit(index);
            }
            self.index_arguments(parent);
        }
    }
}

fn flatten(expression: &Expression) -> Option<(String, String)> {
    match expression {
        Expression::Ident(name) => Some((name.to_string(), name.to_string())),
        Expression::Member(parent, member) => {
            let (root, mut path) = flatten(parent)?;
            match member.as_ref() {
                Member::Attribute(attr) => {
                    path.push('.');
                    path.push_str(attr);
                    Some((root, path))
                }
                Member::Index(_) => Some((root, path)),
                Member::Fields(_) => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_ast;

    fn known(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn records_dependencies_with_paths() {
        let ast = parse_ast("subnet.status.subnetID + vpc.status.vpcID").unwrap();
        let got = inspect(&ast, &known(&["subnet", "vpc", "schema"]));
        assert_eq!(
            got.dependencies,
            vec![
                Dependency {
                    id: "subnet".into(),
                    path: "subnet.status.subnetID".into()
                },
                Dependency {
                    id: "vpc".into(),
                    path: "vpc.status.vpcID".into()
                },
            ]
        );
        assert!(got.unknown.is_empty());
    }

    #[test]
    fn unknown_identifiers_are_reported() {
        let ast = parse_ast("ghost.status.x == schema.spec.name").unwrap();
        let got = inspect(&ast, &known(&["schema"]));
        assert_eq!(got.unknown, vec!["ghost".to_string()]);
        assert_eq!(got.dependencies.len(), 1);
    }

    #[test]
    fn comprehension_variables_shadow() {
        let ast = parse_ast("order.items.filter(v, v.price > schema.spec.limit)").unwrap();
        let got = inspect(&ast, &known(&["order", "schema"]));
        assert_eq!(
            got.dependencies,
            vec![
                Dependency {
                    id: "order".into(),
                    path: "order.items".into()
                },
                Dependency {
                    id: "schema".into(),
                    path: "schema.spec.limit".into()
                },
            ]
        );
        assert!(got.unknown.is_empty());
        // The loop variable is not a call and not unknown.
        assert!(got.function_calls.is_empty());
    }

    #[test]
    fn calls_are_target_qualified() {
        let ast = parse_ast("size(order.items) + order.name.indexOf(\"a\")").unwrap();
        let got = inspect(&ast, &known(&["order"]));
        assert!(got.function_calls.contains(&"size".to_string()));
        assert!(got
            .function_calls
            .contains(&"order.name.indexOf".to_string()));
    }

    #[test]
    fn indices_inside_chains_are_walked() {
        let ast = parse_ast("cluster.subnets[schema.spec.index].id").unwrap();
        let got = inspect(&ast, &known(&["cluster", "schema"]));
        assert!(got
            .dependencies
            .iter()
            .any(|d| d.id == "schema" && d.path == "schema.spec.index"));
        assert!(got
            .dependencies
            .iter()
            .any(|d| d.id == "cluster" && d.path == "cluster.subnets.id"));
    }
}
