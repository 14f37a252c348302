use db::Db;
use flake::Value;
use futures::TryStreamExt;
use index::Fuel;

use crate::{search, Error, Match, Query, Solution};

/// What a query projects per solution: a bound variable's value, or the
/// whole subject graph of a bound subject (the `{?s [*]}` form).
#[derive(Debug, Clone)]
pub enum Selection {
    Var(String),
    SubjectGraph(String),
}

impl Selection {
    pub fn var(name: impl Into<String>) -> Self {
        Selection::Var(name.into())
    }

    pub fn graph(name: impl Into<String>) -> Self {
        Selection::SubjectGraph(name.into())
    }
}

/// Run a query and project each solution through the selections. A single
/// selection yields bare values; several yield one array per solution.
pub async fn select(
    db: &Db,
    query: Query,
    selections: &[Selection],
    fuel: Option<Fuel>,
) -> Result<Vec<serde_json::Value>, Error> {
    let solutions: Vec<Solution> = search(db, query, fuel).try_collect().await?;

    let mut rows = Vec::with_capacity(solutions.len());
    for solution in &solutions {
        let mut cells = Vec::with_capacity(selections.len());
        for selection in selections {
            cells.push(project(db, solution, selection).await?);
        }
        rows.push(if cells.len() == 1 {
            cells.remove(0)
        } else {
            serde_json::Value::Array(cells)
        });
    }
    Ok(rows)
}

async fn project(
    db: &Db,
    solution: &Solution,
    selection: &Selection,
) -> Result<serde_json::Value, Error> {
    match selection {
        Selection::Var(name) => Ok(match solution.get(name) {
            None => serde_json::Value::Null,
            Some(binding) => match_json(db, binding)?,
        }),
        Selection::SubjectGraph(name) => {
            let sid = solution.get(name).and_then(|m| m.as_sid());
            match sid {
                None => Ok(serde_json::Value::Null),
                Some(sid) => Ok(db::subject_graph(db, sid, db.t)
                    .await?
                    .unwrap_or(serde_json::Value::Null)),
            }
        }
    }
}

fn match_json(db: &Db, binding: &Match) -> Result<serde_json::Value, Error> {
    Ok(match binding {
        Match::Sid(sid) => serde_json::Value::String(db.sid_to_iri(sid)?),
        Match::Val(Value::Long(n), _) => serde_json::Value::Number((*n).into()),
        Match::Val(Value::Double(n), _) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(n.to_string())),
        Match::Val(Value::Boolean(b), _) => serde_json::Value::Bool(*b),
        Match::Val(other, _) => serde_json::Value::String(other.to_string()),
    })
}
