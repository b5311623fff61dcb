//! `QueryEngine` backed by a SQL-over-HTTP endpoint.
//!
//! Request: `POST {"sql": "..."}`. Response: `{"columns": [...], "rows":
//! [[...]]}` where binary cells travel as `{"base64": "..."}`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value as Json, json};
use streaming::{BoxFuture, QueryEngine, QueryError, QueryResult, Value};
use tracing::debug;

pub struct HttpQueryEngine {
    client: reqwest::Client,
    url: String,
}

impl HttpQueryEngine {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn post(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "sql": sql }))
            .send()
            .await
            .map_err(|err| QueryError::Unavailable(format!("query engine unreachable: {err}")))?;

        let status = resp.status();
        if status.is_client_error() {
            let message = resp.text().await.unwrap_or_default();
            return Err(QueryError::Sql(format!("{status}: {message}")));
        }
        if !status.is_success() {
            return Err(QueryError::Unavailable(format!("query engine returned {status}")));
        }

        let body: Json = resp
            .json()
            .await
            .map_err(|err| QueryError::Sql(format!("unreadable response: {err}")))?;
        decode_result(&body)
    }
}

impl QueryEngine for HttpQueryEngine {
    fn execute(&self, sql: &str) -> BoxFuture<'_, Result<QueryResult, QueryError>> {
        let sql = sql.to_string();
        Box::pin(async move {
            let result = self.post(&sql).await;
            if let Err(err) = &result {
                debug!(%err, "remote query failed");
            }
            result
        })
    }
}

pub fn decode_result(body: &Json) -> Result<QueryResult, QueryError> {
    let malformed = |what: &str| QueryError::Sql(format!("malformed response: {what}"));
    let columns = body
        .get("columns")
        .and_then(Json::as_array)
        .ok_or_else(|| malformed("missing columns"))?
        .iter()
        .map(|c| c.as_str().map(str::to_string).ok_or_else(|| malformed("column name")))
        .collect::<Result<Vec<_>, _>>()?;

    let rows = match body.get("rows") {
        None | Some(Json::Null) => Vec::new(),
        Some(Json::Array(rows)) => rows
            .iter()
            .map(|row| {
                row.as_array()
                    .ok_or_else(|| malformed("row is not an array"))?
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(malformed("rows is not an array")),
    };
    Ok(QueryResult::new(columns, rows))
}

fn decode_value(cell: &Json) -> Result<Value, QueryError> {
    Ok(match cell {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Text(s.clone()),
        Json::Object(obj) => match obj.get("base64").and_then(Json::as_str) {
            Some(encoded) => Value::Blob(
                STANDARD
                    .decode(encoded)
                    .map_err(|err| QueryError::Sql(format!("bad base64 cell: {err}")))?,
            ),
            None => Value::Text(cell.to_string()),
        },
        Json::Array(_) => Value::Text(cell.to_string()),
    })
}

/// Inverse of `decode_result`, used to answer `/query`.
pub fn encode_result(result: &QueryResult) -> Json {
    let rows: Vec<Json> = result
        .rows
        .iter()
        .map(|row| Json::Array(row.iter().map(encode_value).collect()))
        .collect();
    json!({ "columns": result.columns, "rows": rows })
}

fn encode_value(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Text(s) => Json::String(s.clone()),
        Value::Blob(bytes) => {
            let mut obj = Map::new();
            obj.insert("base64".into(), Json::String(STANDARD.encode(bytes)));
            Json::Object(obj)
        }
    }
}
