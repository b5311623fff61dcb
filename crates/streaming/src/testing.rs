//! In-memory query engine for tests.
//!
//! Answers by the header line every statement builder emits, serving a
//! street-tree dataset covering San Francisco where every tile inside the
//! extent holds a small recognisable payload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use foundation::{DataBounds, LngLat, MercatorBounds, TileCoord, TileRange, lnglat_to_mercator};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::pipeline::TilePipeline;
use crate::query::{BoxFuture, QueryEngine, QueryError, QueryResult, Value};
use crate::sql::StatementKind;

#[derive(Default)]
struct MockState {
    log: Vec<(StatementKind, String)>,
    empty: HashSet<TileCoord>,
    fail_on: HashMap<StatementKind, QueryError>,
    held: HashMap<StatementKind, Arc<Notify>>,
    filter_ids: i64,
    generation: u8,
}

pub(crate) struct MockEngine {
    extent: MercatorBounds,
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        let sw = lnglat_to_mercator(LngLat::new(-122.52, 37.70));
        let ne = lnglat_to_mercator(LngLat::new(-122.35, 37.83));
        Arc::new(Self {
            extent: MercatorBounds::new(sw.x, sw.y, ne.x, ne.y),
            state: Mutex::new(MockState::default()),
        })
    }

    /// Bytes served for `coord` after `generation` base-query validations.
    pub fn payload(coord: TileCoord, generation: u8) -> Vec<u8> {
        vec![coord.z, coord.x as u8, coord.y as u8, generation]
    }

    pub fn fail_on(&self, kind: StatementKind, err: QueryError) {
        self.state.lock().fail_on.insert(kind, err);
    }

    /// The next statement of `kind` is logged but not answered until `release`.
    pub fn hold(&self, kind: StatementKind) {
        self.state.lock().held.insert(kind, Arc::new(Notify::new()));
    }

    pub fn release(&self, kind: StatementKind) {
        if let Some(gate) = self.state.lock().held.remove(&kind) {
            gate.notify_one();
        }
    }

    /// Resolves once a statement of `kind` has reached the engine.
    pub async fn issued(&self, kind: StatementKind) {
        while self.count_kind(kind) == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Forgets the statement log; failures and data stay.
    pub fn reset(&self) {
        self.state.lock().log.clear();
    }

    pub fn set_filter_ids(&self, ids: i64) {
        self.state.lock().filter_ids = ids;
    }

    pub fn set_empty(&self, coord: TileCoord) {
        self.state.lock().empty.insert(coord);
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn count_kind(&self, kind: StatementKind) -> usize {
        self.state.lock().log.iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn kinds(&self) -> Vec<StatementKind> {
        self.state.lock().log.iter().map(|(k, _)| *k).collect()
    }

    pub fn statements(&self, kind: StatementKind) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    fn answer(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let header = Header::parse(sql);
        let mut st = self.state.lock();
        st.log.push((header.kind, sql.to_string()));
        if let Some(err) = st.fail_on.get(&header.kind) {
            return Err(err.clone());
        }

        let none = || QueryResult::new(Vec::new(), Vec::new());
        let result = match header.kind {
            StatementKind::LoadSpatial
            | StatementKind::IdFilter
            | StatementKind::FeatureTable
            | StatementKind::DropTable => none(),
            StatementKind::ValidateBase => {
                st.generation = st.generation.wrapping_add(1);
                none()
            }
            StatementKind::Extent => QueryResult::new(
                ["min_x", "min_y", "max_x", "max_y"].map(String::from).to_vec(),
                vec![vec![
                    Value::Float(self.extent.min_x),
                    Value::Float(self.extent.min_y),
                    Value::Float(self.extent.max_x),
                    Value::Float(self.extent.max_y),
                ]],
            ),
            StatementKind::ProbeAggregates => QueryResult::new(
                vec!["table_name".into()],
                vec![
                    vec![Value::Text("agg_z13".into())],
                    vec![Value::Text("agg_z14".into())],
                ],
            ),
            StatementKind::IdFilterCount => {
                QueryResult::new(vec!["n".into()], vec![vec![Value::Int(st.filter_ids)]])
            }
            StatementKind::ZoomBatch
            | StatementKind::ZoomBatchAggregate
            | StatementKind::Neighborhood
            | StatementKind::SingleTile => {
                let range = header
                    .range
                    .ok_or_else(|| QueryError::Sql(format!("no target in {sql:?}")))?;
                let bounds = DataBounds::new(self.extent);
                let rows = range
                    .iter()
                    .filter(|c| bounds.contains(c) && !st.empty.contains(c))
                    .map(|c| {
                        vec![
                            Value::Int(c.x as i64),
                            Value::Int(c.y as i64),
                            Value::Blob(Self::payload(c, st.generation)),
                        ]
                    })
                    .collect();
                QueryResult::new(["xtile", "ytile", "mvt"].map(String::from).to_vec(), rows)
            }
            StatementKind::Raw => raw_answer(sql),
        };
        Ok(result)
    }
}

impl QueryEngine for MockEngine {
    fn execute(&self, sql: &str) -> BoxFuture<'_, Result<QueryResult, QueryError>> {
        let gate = self.state.lock().held.get(&Header::parse(sql).kind).cloned();
        let result = self.answer(sql);
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            tokio::task::yield_now().await;
            result
        })
    }
}

struct Header {
    kind: StatementKind,
    range: Option<TileRange>,
}

impl Header {
    fn parse(sql: &str) -> Self {
        let raw = Header {
            kind: StatementKind::Raw,
            range: None,
        };
        let Some(line) = sql.lines().next().and_then(|l| l.strip_prefix("-- ")) else {
            return raw;
        };
        let mut words = line.split_whitespace();
        let Some(kind) = words.next().and_then(StatementKind::parse) else {
            return raw;
        };

        let fields: HashMap<&str, &str> = words.filter_map(|w| w.split_once('=')).collect();
        let span = |name: &str| -> Option<(u32, u32)> {
            let value = fields.get(name)?;
            match value.split_once('-') {
                Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
                None => {
                    let v = value.parse().ok()?;
                    Some((v, v))
                }
            }
        };
        let range = (|| {
            let z = fields.get("z")?.parse().ok()?;
            let (x0, x1) = span("x")?;
            let (y0, y1) = span("y")?;
            Some(TileRange::new(z, x0, x1, y0, y1))
        })();
        Header { kind, range }
    }
}

/// Understands `SELECT <int> AS <name>`; anything else yields no rows.
fn raw_answer(sql: &str) -> QueryResult {
    let words: Vec<&str> = sql.split_whitespace().collect();
    match words.as_slice() {
        ["SELECT", n, "AS", name] => match n.parse::<i64>() {
            Ok(n) => QueryResult::new(vec![name.to_string()], vec![vec![Value::Int(n)]]),
            Err(_) => QueryResult::new(Vec::new(), Vec::new()),
        },
        _ => QueryResult::new(Vec::new(), Vec::new()),
    }
}

/// Initialized pipeline on default config with the init queries forgotten.
pub(crate) async fn ready_pipeline(engine: &Arc<MockEngine>) -> Arc<TilePipeline> {
    let pipeline = TilePipeline::new(EngineConfig::default(), engine.clone()).unwrap();
    pipeline.initialize().await.unwrap();
    engine.reset();
    pipeline
}

#[test]
fn header_parsing_reads_ranges_and_tiles() {
    let h = Header::parse("-- neighborhood z=17 x=20964-20969 y=50664-50669\nSELECT 1");
    assert_eq!(h.kind, StatementKind::Neighborhood);
    assert_eq!(h.range, Some(TileRange::new(17, 20964, 20969, 50664, 50669)));

    let h = Header::parse("-- single_tile z=19 x=5 y=6\n...");
    assert_eq!(h.range, Some(TileRange::new(19, 5, 5, 6, 6)));

    let h = Header::parse("SELECT 42 AS answer");
    assert_eq!(h.kind, StatementKind::Raw);
    assert_eq!(raw_answer("SELECT 42 AS answer").scalar(), Some(&Value::Int(42)));
}
