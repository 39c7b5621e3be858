
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStarted {
	pub name: String,
	pub critical: bool,
}
impl_slog!(WorkerStarted, Trace, "a worker task started");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStopped {
	pub name: String,
}
impl_slog!(WorkerStopped, Trace, "a worker task stopped");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalWorkerStopped {
	pub name: String,
}
impl_slog!(CriticalWorkerStopped, Error, "a critical worker stopped unexpectedly");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperShutdown {
	/// Number of requests that were resolved as cancelled.
	pub nb_cancelled: usize,
}
impl_slog!(SweeperShutdown, Info, "sweeper shut down");
