//! RedisBackend — samples shared by every process using the same server.
//!
//! # Key layout
//!
//! ```text
//! {prefix}descriptors         hash  full_name → descriptor JSON
//! {prefix}series:{full_name}  hash  encoded labels → first-seen micros
//! {prefix}values:{full_name}  hash  encoded labels → value
//!                                   encoded labels \x1f sum|count|b{i} (histograms)
//! ```
//!
//! Each mutation is sent as one `MULTI`/`EXEC` block using server-side
//! increments (`HINCRBYFLOAT`, `HINCRBY`), so concurrent writers across
//! processes never lose updates. `clear` deletes every key under the
//! prefix with `SCAN` + `DEL`.
//!
//! Redis refuses non-finite `HINCRBYFLOAT` increments, and a transaction
//! is not rolled back when one of its commands fails. Non-finite
//! contributions are therefore never sent as float increments: each one
//! bumps an integer companion field instead,
//!
//! ```text
//! {field} \x1f pinf | ninf | nan    count of +Inf / -Inf / NaN contributions
//! ```
//!
//! and reads fold them back in with IEEE semantics (`+Inf + -Inf = NaN`).
//!
//! Connections come from a small pool; a slow round trip only holds its
//! own slot.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use tally_core::config::{RedisConfig, StorageKind};
use tally_core::types::{first_bucket, format_float, parse_float};
use tally_core::{
    HistogramSample, LabelSet, MetricDescriptor, MetricFamily, MetricKind, MetricsError,
    MetricsResult, Mutation, Sample,
};
use tracing::{debug, warn};

use crate::StorageBackend;
use crate::resp::{Reply, RespConnection};
use crate::tables::KEY_SEPARATOR;

/// Convert any `Display` error into a `MetricsError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| MetricsError::$variant(e.to_string())
    };
}

/// Keys fetched per `SCAN` iteration during `clear`.
const SCAN_COUNT: &str = "200";

type Slot = Mutex<Option<RespConnection>>;

/// Shared backend over a pool of lazily (re)established connections.
pub struct RedisBackend {
    config: RedisConfig,
    pool: Vec<Slot>,
    /// Round-robin starting point for slot checkout.
    next: AtomicUsize,
    /// Families whose descriptor this process has already verified.
    known: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("key_prefix", &self.config.key_prefix)
            .field("pool_size", &self.pool.len())
            .finish()
    }
}

impl RedisBackend {
    /// Connect, authenticate, select the database and `PING`.
    pub fn connect(config: &RedisConfig) -> MetricsResult<Self> {
        let mut conn = open(config)?;
        let pong = conn.command(&["PING"]).map_err(map_err!(BackendUnavailable))?;
        if pong != Reply::Simple("PONG".to_string()) {
            return Err(MetricsError::BackendUnavailable(format!(
                "unexpected PING reply: {pong:?}"
            )));
        }
        debug!(host = %config.host, port = config.port, db = config.database, "redis backend connected");
        let mut pool: Vec<Slot> = (0..config.pool_size.max(1)).map(|_| Mutex::new(None)).collect();
        pool[0] = Mutex::new(Some(conn));
        Ok(Self {
            config: config.clone(),
            pool,
            next: AtomicUsize::new(0),
            known: Mutex::new(HashSet::new()),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.config.key_prefix)
    }

    fn descriptors_key(&self) -> String {
        self.key("descriptors")
    }

    fn series_key(&self, full_name: &str) -> String {
        self.key(&format!("series:{full_name}"))
    }

    fn values_key(&self, full_name: &str) -> String {
        self.key(&format!("values:{full_name}"))
    }

    /// First free slot from a rotating start; waits on the start slot if all are busy.
    fn checkout(&self) -> MutexGuard<'_, Option<RespConnection>> {
        let len = self.pool.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        for i in 0..len {
            if let Some(guard) = self.pool[(start + i) % len].try_lock() {
                return guard;
            }
        }
        self.pool[start].lock()
    }

    /// Run `f` on a pooled connection, reconnecting first if the last call broke it.
    ///
    /// I/O failures drop the connection and surface as `BackendUnavailable`.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut RespConnection) -> io::Result<T>,
    ) -> MetricsResult<T> {
        let mut slot = self.checkout();
        if slot.is_none() {
            *slot = Some(open(&self.config)?);
            debug!("redis connection established");
        }
        let Some(conn) = slot.as_mut() else {
            return Err(MetricsError::BackendUnavailable("no connection".into()));
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(error = %e, "redis i/o failed, dropping connection");
                *slot = None;
                Err(MetricsError::BackendUnavailable(e.to_string()))
            }
        }
    }

    /// Run `commands` inside `MULTI`/`EXEC` and return the per-command results.
    fn transaction(&self, commands: Vec<Vec<String>>) -> MetricsResult<Vec<Reply>> {
        let count = commands.len();
        let mut batch = Vec::with_capacity(count + 2);
        batch.push(vec!["MULTI".to_string()]);
        batch.extend(commands);
        batch.push(vec!["EXEC".to_string()]);

        let mut replies = self.with_conn(|conn| conn.pipeline(&batch))?;
        let exec = replies.pop().unwrap_or(Reply::Array(None));
        for reply in &replies {
            check(reply)?;
        }
        let results = check(&exec)?
            .clone()
            .into_array()
            .ok_or_else(|| MetricsError::Serialization("transaction aborted".into()))?;
        if results.len() != count {
            return Err(MetricsError::Serialization(format!(
                "expected {count} transaction results, got {}",
                results.len()
            )));
        }
        for reply in &results {
            check(reply)?;
        }
        Ok(results)
    }

    fn descriptor_commands(&self, descriptor: &MetricDescriptor) -> MetricsResult<Vec<Vec<String>>> {
        let name = descriptor.full_name();
        let json = serde_json::to_string(descriptor).map_err(map_err!(Serialization))?;
        Ok(vec![
            vec!["HSETNX".into(), self.descriptors_key(), name.clone(), json],
            vec!["HGET".into(), self.descriptors_key(), name],
        ])
    }

    fn mutation_commands(
        &self,
        descriptor: &MetricDescriptor,
        field: &str,
        mutation: Mutation,
    ) -> Vec<Vec<String>> {
        let values = self.values_key(&descriptor.full_name());
        match mutation {
            Mutation::Add(delta) => vec![add_command(&values, field, delta)],
            Mutation::Set(value) => set_commands(&values, field, value),
            Mutation::Observe(value) => {
                let mut commands = vec![
                    add_command(&values, &histogram_field(field, "sum"), value),
                    vec![
                        "HINCRBY".into(),
                        values.clone(),
                        histogram_field(field, "count"),
                        "1".into(),
                    ],
                ];
                let start = first_bucket(&descriptor.buckets, value);
                for i in start..=descriptor.buckets.len() {
                    commands.push(vec![
                        "HINCRBY".into(),
                        values.clone(),
                        histogram_field(field, &format!("b{i}")),
                        "1".into(),
                    ]);
                }
                commands
            }
        }
    }

    fn read_family(&self, descriptor: MetricDescriptor) -> MetricsResult<MetricFamily> {
        let name = descriptor.full_name();
        let results = self.transaction(vec![
            vec!["HGETALL".into(), self.series_key(&name)],
            vec!["HGETALL".into(), self.values_key(&name)],
        ])?;
        let mut results = results.into_iter();
        let series = hash_pairs(results.next().unwrap_or(Reply::Array(None)));
        let values: HashMap<String, String> =
            hash_pairs(results.next().unwrap_or(Reply::Array(None)))
                .into_iter()
                .collect();

        let mut ordered: Vec<(u64, String)> = series
            .into_iter()
            .map(|(labels, micros)| (micros.parse().unwrap_or(u64::MAX), labels))
            .collect();
        ordered.sort();

        let value_of = |field: &str| read_value(&values, field);
        let count_of = |field: &str| values.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let mut samples = Vec::with_capacity(ordered.len());
        for (_, encoded) in ordered {
            let sample = match descriptor.kind {
                MetricKind::Counter => Sample::Counter { value: value_of(&encoded) },
                MetricKind::Gauge => Sample::Gauge { value: value_of(&encoded) },
                MetricKind::Histogram => {
                    let mut h = HistogramSample::new(descriptor.buckets.len());
                    for (i, bucket) in h.buckets.iter_mut().enumerate() {
                        *bucket = count_of(&histogram_field(&encoded, &format!("b{i}")));
                    }
                    h.sum = value_of(&histogram_field(&encoded, "sum"));
                    h.count = count_of(&histogram_field(&encoded, "count"));
                    Sample::Histogram(h)
                }
            };
            samples.push((LabelSet::decode(&encoded)?, sample));
        }

        Ok(MetricFamily { descriptor, samples })
    }
}

impl StorageBackend for RedisBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Redis
    }

    fn get_or_create_descriptor(&self, descriptor: &MetricDescriptor) -> MetricsResult<MetricDescriptor> {
        let commands = self.descriptor_commands(descriptor)?;
        let replies = self.with_conn(|conn| conn.pipeline(&commands))?;
        for reply in &replies {
            check(reply)?;
        }
        let stored = replies
            .get(1)
            .and_then(Reply::as_text)
            .ok_or_else(|| MetricsError::Serialization("descriptor vanished after HSETNX".into()))?;
        let stored: MetricDescriptor =
            serde_json::from_str(&stored).map_err(map_err!(Serialization))?;

        stored.check_compatible(descriptor)?;
        self.known.lock().insert(descriptor.full_name());
        Ok(stored)
    }

    fn write_sample(
        &self,
        descriptor: &MetricDescriptor,
        labels: &LabelSet,
        mutation: Mutation,
    ) -> MetricsResult<()> {
        let name = descriptor.full_name();
        if !self.known.lock().contains(&name) {
            let stored = self.get_or_create_descriptor(descriptor)?;
            if stored.kind != descriptor.kind {
                return Err(MetricsError::TypeMismatch {
                    name,
                    existing: stored.kind,
                    requested: descriptor.kind,
                });
            }
        }

        let field = labels.encode()?;
        let json = serde_json::to_string(descriptor).map_err(map_err!(Serialization))?;
        let mut commands = vec![
            vec!["HSETNX".into(), self.descriptors_key(), name.clone(), json],
            vec![
                "HSETNX".into(),
                self.series_key(&name),
                field.clone(),
                now_micros().to_string(),
            ],
        ];
        commands.extend(self.mutation_commands(descriptor, &field, mutation));
        self.transaction(commands)?;
        Ok(())
    }

    fn read_all(&self) -> MetricsResult<Vec<MetricFamily>> {
        let key = self.descriptors_key();
        let reply = self.with_conn(|conn| conn.command(&["HGETALL", key.as_str()]))?;
        let reply = check(&reply)?.clone();

        let mut descriptors = Vec::new();
        for (name, json) in hash_pairs(reply) {
            match serde_json::from_str::<MetricDescriptor>(&json) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => warn!(%name, error = %e, "skipping undecodable descriptor"),
            }
        }
        descriptors.sort_by_key(|d| d.full_name());

        descriptors
            .into_iter()
            .map(|descriptor| self.read_family(descriptor))
            .collect()
    }

    fn clear(&self) -> MetricsResult<()> {
        let pattern = format!("{}*", glob_escape(&self.config.key_prefix));
        let mut cursor = "0".to_string();
        let mut deleted = 0usize;
        loop {
            let reply = self.with_conn(|conn| {
                conn.command(&["SCAN", cursor.as_str(), "MATCH", pattern.as_str(), "COUNT", SCAN_COUNT])
            })?;
            let mut parts = check(&reply)?
                .clone()
                .into_array()
                .ok_or_else(|| MetricsError::Serialization("malformed SCAN reply".into()))?
                .into_iter();
            cursor = parts
                .next()
                .and_then(|r| r.as_text())
                .ok_or_else(|| MetricsError::Serialization("SCAN reply without cursor".into()))?;
            let keys: Vec<String> = parts
                .next()
                .and_then(Reply::into_array)
                .unwrap_or_default()
                .iter()
                .filter_map(Reply::as_text)
                .collect();

            if !keys.is_empty() {
                let mut del = vec!["DEL".to_string()];
                del.extend(keys.iter().cloned());
                let reply = self.with_conn(|conn| conn.command(&del))?;
                check(&reply)?;
                deleted += keys.len();
            }
            if cursor == "0" {
                break;
            }
        }
        self.known.lock().clear();
        debug!(deleted, prefix = %self.config.key_prefix, "redis backend cleared");
        Ok(())
    }
}

/// Open a connection and run the `AUTH`/`SELECT` handshake.
fn open(config: &RedisConfig) -> MetricsResult<RespConnection> {
    let mut conn = RespConnection::connect(
        &config.host,
        config.port,
        Duration::from_millis(config.connect_timeout_ms),
        Duration::from_millis(config.io_timeout_ms),
    )
    .map_err(map_err!(BackendUnavailable))?;

    if let Some(password) = &config.password {
        let reply = conn
            .command(&["AUTH", password.as_str()])
            .map_err(map_err!(BackendUnavailable))?;
        if let Reply::Error(e) = reply {
            return Err(MetricsError::BackendUnavailable(format!("AUTH failed: {e}")));
        }
    }
    if config.database != 0 {
        let db = config.database.to_string();
        let reply = conn
            .command(&["SELECT", db.as_str()])
            .map_err(map_err!(BackendUnavailable))?;
        if let Reply::Error(e) = reply {
            return Err(MetricsError::BackendUnavailable(format!("SELECT failed: {e}")));
        }
    }
    Ok(conn)
}

/// Turn a server error reply into an error; pass everything else through.
fn check(reply: &Reply) -> MetricsResult<&Reply> {
    match reply {
        Reply::Error(e) => Err(MetricsError::Serialization(format!("redis: {e}"))),
        other => Ok(other),
    }
}

/// Flat `HGETALL` reply → field/value pairs.
fn hash_pairs(reply: Reply) -> Vec<(String, String)> {
    let items: Vec<String> = reply
        .into_array()
        .unwrap_or_default()
        .iter()
        .filter_map(Reply::as_text)
        .collect();
    items
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn histogram_field(labels: &str, part: &str) -> String {
    format!("{labels}{KEY_SEPARATOR}{part}")
}

/// A non-finite contribution to a float field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonFinite {
    PosInf,
    NegInf,
    NaN,
}

impl NonFinite {
    const ALL: [NonFinite; 3] = [NonFinite::PosInf, NonFinite::NegInf, NonFinite::NaN];

    fn of(value: f64) -> Option<Self> {
        if value.is_nan() {
            Some(NonFinite::NaN)
        } else if value == f64::INFINITY {
            Some(NonFinite::PosInf)
        } else if value == f64::NEG_INFINITY {
            Some(NonFinite::NegInf)
        } else {
            None
        }
    }

    fn field(self, field: &str) -> String {
        let suffix = match self {
            NonFinite::PosInf => "pinf",
            NonFinite::NegInf => "ninf",
            NonFinite::NaN => "nan",
        };
        format!("{field}{KEY_SEPARATOR}{suffix}")
    }
}

/// `HINCRBYFLOAT` for finite deltas, a companion `HINCRBY` otherwise.
fn add_command(values: &str, field: &str, delta: f64) -> Vec<String> {
    match NonFinite::of(delta) {
        None => vec![
            "HINCRBYFLOAT".into(),
            values.to_string(),
            field.to_string(),
            format_float(delta),
        ],
        Some(class) => vec!["HINCRBY".into(), values.to_string(), class.field(field), "1".into()],
    }
}

/// Overwrite a float field, including its non-finite companions.
fn set_commands(values: &str, field: &str, value: f64) -> Vec<Vec<String>> {
    let class = NonFinite::of(value);
    let finite = if class.is_some() { 0.0 } else { value };

    let mut hdel = vec!["HDEL".to_string(), values.to_string()];
    hdel.extend(NonFinite::ALL.iter().map(|c| c.field(field)));

    let mut commands = vec![
        vec!["HSET".into(), values.to_string(), field.to_string(), format_float(finite)],
        hdel,
    ];
    if let Some(class) = class {
        commands.push(vec!["HINCRBY".into(), values.to_string(), class.field(field), "1".into()]);
    }
    commands
}

/// Stored float field with its non-finite contributions folded back in.
fn read_value(values: &HashMap<String, String>, field: &str) -> f64 {
    let finite = values.get(field).and_then(|v| parse_float(v)).unwrap_or(0.0);
    let seen = |class: NonFinite| {
        values
            .get(&class.field(field))
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|n| n > 0)
    };
    let (pos, neg) = (seen(NonFinite::PosInf), seen(NonFinite::NegInf));
    if seen(NonFinite::NaN) || (pos && neg) {
        f64::NAN
    } else if pos {
        f64::INFINITY
    } else if neg {
        f64::NEG_INFINITY
    } else {
        finite
    }
}

/// Escape glob metacharacters so the prefix matches literally in `SCAN MATCH`.
fn glob_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn now_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_escape_quotes_metacharacters() {
        assert_eq!(glob_escape("tally:"), "tally:");
        assert_eq!(glob_escape("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn hash_pairs_from_flat_array() {
        let reply = Reply::Array(Some(vec![
            Reply::Bulk(Some(b"a".to_vec())),
            Reply::Bulk(Some(b"1".to_vec())),
            Reply::Bulk(Some(b"b".to_vec())),
            Reply::Bulk(Some(b"2".to_vec())),
        ]));
        assert_eq!(
            hash_pairs(reply),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert!(hash_pairs(Reply::Array(None)).is_empty());
    }

    #[test]
    fn error_reply_is_not_unavailability() {
        let err = check(&Reply::Error("WRONGTYPE".into())).unwrap_err();
        assert!(!err.is_backend_unavailable());
    }

    #[test]
    fn non_finite_adds_use_integer_companions() {
        assert_eq!(add_command("v", "f", 1.5)[0], "HINCRBYFLOAT");
        for value in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let command = add_command("v", "f", value);
            assert_eq!(command[0], "HINCRBY");
            assert_ne!(command[2], "f");
        }
    }

    #[test]
    fn non_finite_classes_fold_like_ieee_sums() {
        let values = |pairs: &[(String, &str)]| -> HashMap<String, String> {
            pairs.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
        };
        let pinf = NonFinite::PosInf.field("f");
        let ninf = NonFinite::NegInf.field("f");

        assert_eq!(read_value(&values(&[("f".into(), "2.5")]), "f"), 2.5);
        assert_eq!(read_value(&values(&[("f".into(), "2.5"), (pinf.clone(), "1")]), "f"), f64::INFINITY);
        assert_eq!(read_value(&values(&[(ninf.clone(), "3")]), "f"), f64::NEG_INFINITY);
        assert!(read_value(&values(&[(pinf, "1"), (ninf, "1")]), "f").is_nan());
        assert_eq!(read_value(&HashMap::new(), "f"), 0.0);
    }

    #[test]
    fn set_clears_non_finite_companions() {
        let commands = set_commands("v", "f", 4.0);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], vec!["HSET", "v", "f", "4"]);
        assert_eq!(commands[1].len(), 5);

        let commands = set_commands("v", "f", f64::INFINITY);
        assert_eq!(commands[0][3], "0");
        assert_eq!(commands[2], vec!["HINCRBY".to_string(), "v".into(), NonFinite::PosInf.field("f"), "1".into()]);
    }

    #[test]
    fn connect_refused_is_unavailable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = RedisConfig {
            port,
            connect_timeout_ms: 200,
            ..RedisConfig::default()
        };
        let err = RedisBackend::connect(&config).unwrap_err();
        assert!(err.is_backend_unavailable());
    }
}
