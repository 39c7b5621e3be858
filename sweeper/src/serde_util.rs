
use std::fmt;

use serde::{de, Deserializer, Serializer};

pub mod duration {
	use super::*;

	use std::time::Duration;

	pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(&humantime::format_duration(*duration))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		struct Visitor;

		impl<'de> de::Visitor<'de> for Visitor {
			type Value = Duration;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("a duration")
			}

			fn visit_str<E: de::Error>(self, s: &str) -> Result<Self::Value, E> {
				humantime::parse_duration(s).map_err(de::Error::custom)
			}
		}
		d.deserialize_str(Visitor)
	}
}

pub mod fee_rate {
	use super::*;

	use bitcoin::FeeRate;

	pub fn serialize<S: Serializer>(fee_rate: &FeeRate, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(&format_args!("{}sat/kwu", fee_rate.to_sat_per_kwu()))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FeeRate, D::Error> {
		struct Visitor;

		impl<'de> de::Visitor<'de> for Visitor {
			type Value = FeeRate;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("a fee rate")
			}

			fn visit_str<E: de::Error>(self, s: &str) -> Result<Self::Value, E> {
				if let Some(stripped) = s.strip_suffix("sat/vb") {
					if let Ok(number) = stripped.trim().parse::<u64>() {
						if let Some(fr) = FeeRate::from_sat_per_vb(number) {
							return Ok(fr);
						}
					}
				} else if let Some(stripped) = s.strip_suffix("sat/kwu") {
					if let Ok(number) = stripped.trim().parse::<u64>() {
						return Ok(FeeRate::from_sat_per_kwu(number));
					}
				}

				Err(de::Error::custom("Failed to parse FeeRate in sat/kwu or sat/vb"))
			}
		}
		d.deserialize_str(Visitor)
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use bitcoin::FeeRate;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Test {
		#[serde(with = "super::duration")]
		window: Duration,
		#[serde(with = "super::fee_rate")]
		fee_rate: FeeRate,
	}

	#[test]
	fn parse_units() {
		let t = toml::from_str::<Test>("window = \"1m 30s\"\nfee_rate = \"10sat/vb\"").unwrap();
		assert_eq!(t.window, Duration::from_secs(90));
		assert_eq!(t.fee_rate, FeeRate::from_sat_per_vb_unchecked(10));

		let t = toml::from_str::<Test>("window = \"500ms\"\nfee_rate = \"253 sat/kwu\"").unwrap();
		assert_eq!(t.window, Duration::from_millis(500));
		assert_eq!(t.fee_rate, FeeRate::from_sat_per_kwu(253));

		assert!(toml::from_str::<Test>("window = \"1s\"\nfee_rate = \"10 BTC\"").is_err());
		assert!(toml::from_str::<Test>("window = \"soon\"\nfee_rate = \"1sat/vb\"").is_err());
	}

	#[test]
	fn render() {
		let t = Test { window: Duration::from_secs(30), fee_rate: FeeRate::from_sat_per_kwu(250) };
		let s = toml::to_string(&t).unwrap();
		assert_eq!(s, "window = \"30s\"\nfee_rate = \"250sat/kwu\"\n");
		assert_eq!(toml::from_str::<Test>(&s).unwrap(), t);
	}
}
