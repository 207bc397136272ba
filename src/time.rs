
use std::time::{UNIX_EPOCH, Duration, SystemTime};

/// Extension trait for time types.
pub(crate) trait TimeExt {
	/// Create a time from a Unix timestamp in seconds.
	///
	/// Zero and negative timestamps map to the epoch.
	fn from_unix_secs(secs: i64) -> Self;

	/// Return the Unix timestamp in seconds for this time.
	fn unix_secs(&self) -> i64;

	/// Returns the duration since the other time, returning the zero duration
	/// if the other time is in the future.
	fn saturating_duration_since(&self, other: SystemTime) -> Duration;

	/// Same as [SystemTime::elapsed], but saturating to 0 if negative.
	fn saturating_elapsed(&self) -> Duration;
}

impl TimeExt for SystemTime {
	fn from_unix_secs(secs: i64) -> Self {
		if secs <= 0 {
			UNIX_EPOCH
		} else {
			UNIX_EPOCH + Duration::from_secs(secs as u64)
		}
	}

	fn unix_secs(&self) -> i64 {
		self.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
	}

	fn saturating_duration_since(&self, other: SystemTime) -> Duration {
		self.duration_since(other).unwrap_or_default()
	}

	fn saturating_elapsed(&self) -> Duration {
		SystemTime::now().saturating_duration_since(*self)
	}
}
