#[macro_use] extern crate serde;

#[macro_use]
mod macros;
mod msgs;
pub use crate::msgs::*;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{Serialize, SerializeMap, Serializer};


/// The "target" field used for structured logging.
pub const SLOG_TARGET: &str = "sweeper-slog";

const LOGID_FIELD: &str = "slog_id";
const DATA_FIELD: &str = "slog_data";

/// Trait implemented by all our structured log messages.
pub trait LogMsg: Sized + Send + fmt::Debug + Serialize + DeserializeOwned + 'static {
	const LOGID: &'static str;
	const LEVEL: log::Level;
	const MSG: &'static str;
}

/// Emit the structured log message.
///
/// Use the [slog] macro instead of calling this directly.
pub fn log<T: LogMsg>(msg: &T, file: &str, line: u32) {
	let kv = [
		(LOGID_FIELD, log::kv::Value::from(T::LOGID)),
		(DATA_FIELD, log::kv::Value::from_serde(msg)),
	];
	log::logger().log(&log::Record::builder()
		.args(format_args!("{}", T::MSG))
		.level(T::LEVEL)
		.target(SLOG_TARGET)
		.file(Some(file))
		.line(Some(line))
		.key_values(&kv)
		.build()
	);
}

/// A wrapper around a [log::Record] that implements [serde::Serialize].
///
/// Key-value pairs are flattened into the top-level object.
pub struct RecordSerializeWrapper<'a>(pub &'a log::Record<'a>);

impl<'a> Serialize for RecordSerializeWrapper<'a> {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		use serde::ser::Error;

		struct Visitor<'a, S: Serializer>(&'a mut <S as Serializer>::SerializeMap);
		impl<'a, 'kvs, S: Serializer> log::kv::VisitSource<'kvs> for Visitor<'a, S> {
			fn visit_pair(
				&mut self, key: log::kv::Key<'kvs>, value: log::kv::Value<'kvs>,
			) -> Result<(), log::kv::Error> {
				self.0.serialize_entry(key.as_str(), &value).map_err(|e| {
					log::kv::Error::boxed(format!("serialize error: {:?}", e))
				})?;
				Ok(())
			}
		}

		let mut m = s.serialize_map(None)?;
		m.serialize_entry("msg", self.0.args())?;
		m.serialize_entry("level", self.0.level().as_str())?;
		m.serialize_entry("target", self.0.target())?;
		if let Some(file) = self.0.file() {
			m.serialize_entry("file", file)?;
		}
		if let Some(line) = self.0.line() {
			m.serialize_entry("line", &line)?;
		}
		let mut v = Visitor::<S>(&mut m);
		self.0.key_values().visit(&mut v).map_err(S::Error::custom)?;
		m.end()
	}
}

#[derive(Debug)]
pub enum RecordParseError {
	WrongType,
	Json(serde_json::Error),
}

impl fmt::Display for RecordParseError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RecordParseError::WrongType => f.write_str("log record of a different type"),
			RecordParseError::Json(e) => write!(f, "invalid log record json: {}", e),
		}
	}
}

pub fn parse_record(record: &str) -> Result<ParsedRecord, RecordParseError> {
	serde_json::from_str(record).map_err(RecordParseError::Json)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRecord {
	pub msg: String,
	pub level: String,
	pub target: String,
	pub file: Option<String>,
	pub line: Option<u32>,
	pub slog_id: Option<String>,
	pub slog_data: Option<serde_json::Value>,
}

impl ParsedRecord {
	/// Whether this is a structured log message.
	pub fn is_slog(&self) -> bool {
		self.slog_id.is_some()
	}

	/// Check whether this log message is of the given structured log type.
	pub fn is<T: LogMsg>(&self) -> bool {
		self.slog_id.as_deref() == Some(T::LOGID)
	}

	/// Try to parse the log message into the given structured log type.
	pub fn try_as<T: LogMsg>(&self) -> Result<T, RecordParseError> {
		if !self.is::<T>() {
			return Err(RecordParseError::WrongType);
		}

		let data = self.slog_data.clone().unwrap_or(serde_json::Value::Null);
		serde_json::from_value(data).map_err(RecordParseError::Json)
	}
}
