use flake::{compare_obj, dt, Value};

use crate::{Error, Match, Solution};

/// Expressions usable in bind and filter patterns. A closed set of
/// operators; the query surface parsers compile down to this.
#[derive(Debug, Clone)]
pub enum Expr {
    Var(String),
    Literal(serde_json::Value),
    Call(Op, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Not,
    Str,
    Strlen,
    Concat,
    Abs,
    Bound,
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn lit(value: impl Into<serde_json::Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn call(op: Op, args: Vec<Expr>) -> Self {
        Expr::Call(op, args)
    }
}

/// Evaluate an expression against a solution's bindings.
pub fn eval(expr: &Expr, solution: &Solution) -> Result<Match, Error> {
    match expr {
        Expr::Var(name) => solution
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnboundVariable(name.clone())),
        Expr::Literal(value) => literal_match(value),
        Expr::Call(Op::Bound, args) => {
            let bound = match args.first() {
                Some(Expr::Var(name)) => solution.contains_key(name),
                _ => return Err(Error::ExprType("bound expects a variable".to_string())),
            };
            Ok(boolean(bound))
        }
        Expr::Call(op, args) => {
            let args: Vec<Match> = args
                .iter()
                .map(|arg| eval(arg, solution))
                .collect::<Result<_, _>>()?;
            apply(*op, &args)
        }
    }
}

/// Evaluate a filter expression: it must come out boolean.
pub fn eval_filter(expr: &Expr, solution: &Solution) -> Result<bool, Error> {
    match eval(expr, solution)? {
        Match::Val(Value::Boolean(b), _) => Ok(b),
        other => Err(Error::ExprType(format!(
            "filter produced a non-boolean: {other:?}"
        ))),
    }
}

fn literal_match(value: &serde_json::Value) -> Result<Match, Error> {
    let datatype = flake::coerce::infer(value, None);
    let coerced = flake::coerce::coerce(value, &datatype)
        .map_err(|err| Error::ExprType(err.to_string()))?;
    Ok(Match::Val(coerced, datatype))
}

fn boolean(b: bool) -> Match {
    Match::Val(Value::Boolean(b), dt::boolean())
}

fn apply(op: Op, args: &[Match]) -> Result<Match, Error> {
    use Op::*;
    match op {
        Eq => binary(args, |l, r| Ok(boolean(l.same(r)))),
        Ne => binary(args, |l, r| Ok(boolean(!l.same(r)))),
        Lt | Le | Gt | Ge => binary(args, |l, r| {
            let ord = compare(l, r)?;
            let ok = match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(boolean(ok))
        }),
        Add | Sub | Mul | Div => binary(args, |l, r| arithmetic(op, l, r)),
        And => Ok(boolean(
            args.iter()
                .map(truthy)
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .all(|b| b),
        )),
        Or => Ok(boolean(
            args.iter()
                .map(truthy)
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .any(|b| b),
        )),
        Not => {
            let value = args
                .first()
                .ok_or_else(|| Error::ExprType("not expects one argument".to_string()))?;
            Ok(boolean(!truthy(value)?))
        }
        Str => {
            let value = args
                .first()
                .ok_or_else(|| Error::ExprType("str expects one argument".to_string()))?;
            Ok(Match::Val(Value::String(printed(value)), dt::string()))
        }
        Strlen => match args.first() {
            Some(Match::Val(Value::String(s), _)) => {
                Ok(Match::Val(Value::Long(s.chars().count() as i64), dt::long()))
            }
            _ => Err(Error::ExprType("strlen expects a string".to_string())),
        },
        Concat => {
            let joined: String = args.iter().map(printed).collect();
            Ok(Match::Val(Value::String(joined), dt::string()))
        }
        Abs => match args.first() {
            Some(Match::Val(Value::Long(n), datatype)) => {
                Ok(Match::Val(Value::Long(n.abs()), datatype.clone()))
            }
            Some(Match::Val(Value::Double(n), datatype)) => {
                Ok(Match::Val(Value::Double(n.abs()), datatype.clone()))
            }
            _ => Err(Error::ExprType("abs expects a number".to_string())),
        },
        Bound => unreachable!("handled before argument evaluation"),
    }
}

fn binary(
    args: &[Match],
    apply: impl FnOnce(&Match, &Match) -> Result<Match, Error>,
) -> Result<Match, Error> {
    match args {
        [l, r] => apply(l, r),
        _ => Err(Error::ExprType(format!(
            "expected two arguments, got {}",
            args.len()
        ))),
    }
}

fn compare(l: &Match, r: &Match) -> Result<std::cmp::Ordering, Error> {
    match (l, r) {
        (Match::Val(lv, ld), Match::Val(rv, rd)) => Ok(compare_obj(lv, ld, rv, rd)),
        (Match::Sid(l), Match::Sid(r)) => Ok(l.cmp(r)),
        _ => Err(Error::ExprType(
            "cannot order a literal against a reference".to_string(),
        )),
    }
}

fn arithmetic(op: Op, l: &Match, r: &Match) -> Result<Match, Error> {
    let (l, r) = match (l, r) {
        (Match::Val(l, _), Match::Val(r, _)) => (l, r),
        _ => return Err(Error::ExprType("arithmetic expects literals".to_string())),
    };
    match (l, r) {
        (Value::Long(l), Value::Long(r)) if op != Op::Div => {
            let result = match op {
                Op::Add => l.checked_add(*r),
                Op::Sub => l.checked_sub(*r),
                Op::Mul => l.checked_mul(*r),
                _ => unreachable!(),
            }
            .ok_or_else(|| Error::ExprType("integer overflow".to_string()))?;
            Ok(Match::Val(Value::Long(result), dt::long()))
        }
        _ => {
            let (l, r) = match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => (l, r),
                _ => return Err(Error::ExprType("arithmetic expects numbers".to_string())),
            };
            let result = match op {
                Op::Add => l + r,
                Op::Sub => l - r,
                Op::Mul => l * r,
                Op::Div => l / r,
                _ => unreachable!(),
            };
            Ok(Match::Val(Value::Double(result), dt::decimal()))
        }
    }
}

fn truthy(value: &Match) -> Result<bool, Error> {
    match value {
        Match::Val(Value::Boolean(b), _) => Ok(*b),
        other => Err(Error::ExprType(format!("expected a boolean, got {other:?}"))),
    }
}

fn printed(value: &Match) -> String {
    match value {
        Match::Sid(sid) => sid.to_string(),
        Match::Val(v, _) => v.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn solution(pairs: &[(&str, i64)]) -> Solution {
        pairs
            .iter()
            .map(|(name, n)| {
                (
                    (*name).to_string(),
                    Match::Val(Value::Long(*n), dt::long()),
                )
            })
            .collect()
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let sol = solution(&[("?x", 6), ("?y", 7)]);

        let product = eval(
            &Expr::call(Op::Mul, vec![Expr::var("?x"), Expr::var("?y")]),
            &sol,
        )
        .unwrap();
        assert!(product.same(&Match::Val(Value::Long(42), dt::long())));

        assert!(eval_filter(
            &Expr::call(Op::Lt, vec![Expr::var("?x"), Expr::var("?y")]),
            &sol
        )
        .unwrap());
        assert!(!eval_filter(
            &Expr::call(Op::Ge, vec![Expr::var("?x"), Expr::var("?y")]),
            &sol
        )
        .unwrap());
    }

    #[test]
    fn test_unbound_variable_errors() {
        let sol = solution(&[]);
        assert!(matches!(
            eval(&Expr::var("?missing"), &sol),
            Err(Error::UnboundVariable(_))
        ));
        // bound() on the same variable answers false instead of failing.
        assert!(!eval_filter(&Expr::call(Op::Bound, vec![Expr::var("?missing")]), &sol).unwrap());
    }

    #[test]
    fn test_string_builtins() {
        let mut sol = Solution::new();
        sol.insert(
            "?name".to_string(),
            Match::Val(Value::String("Alice".to_string()), dt::string()),
        );

        let len = eval(&Expr::call(Op::Strlen, vec![Expr::var("?name")]), &sol).unwrap();
        assert!(len.same(&Match::Val(Value::Long(5), dt::long())));

        let greeting = eval(
            &Expr::call(
                Op::Concat,
                vec![Expr::lit("hello "), Expr::var("?name")],
            ),
            &sol,
        )
        .unwrap();
        assert!(greeting.same(&Match::Val(
            Value::String("hello Alice".to_string()),
            dt::string()
        )));
    }

    #[test]
    fn test_division_always_decimal() {
        let sol = solution(&[("?x", 7), ("?y", 2)]);
        let quotient = eval(
            &Expr::call(Op::Div, vec![Expr::var("?x"), Expr::var("?y")]),
            &sol,
        )
        .unwrap();
        assert!(quotient.same(&Match::Val(Value::Double(3.5), dt::decimal())));
    }
}
