/// the cluster runtime: a supervisor owning up to N worker units.
///
/// each worker is an independently owned single-threaded unit holding
/// its own local cache; there is no shared memory between workers, and
/// all coordination flows through the supervisor's explicit message
/// relay.  the supervisor keeps the pool at size (respawning unexpected
/// exits with backoff), runs the freshness poller, and drains the pool
/// cooperatively on shutdown.
///
pub mod supervisor;
pub mod worker;
