/// Worker state definitions for termination tracking
///
/// Workers report these states to `CrawlState` as they move through their loop.
/// They are reporting states, not a strict FSM: a worker may report `Waiting`
/// many times in a row, or skip `PushingResult` when it has nothing to emit.
use std::fmt;

/// The two worker roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Expands fetched page bundles into prioritized child URLs
    Crawler,
    /// Downloads and parses URLs into page bundles
    Fetcher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawler => "crawler",
            Self::Fetcher => "fetcher",
        }
    }

    /// The role that consumes what this role produces
    pub fn peer(&self) -> Self {
        match self {
            Self::Crawler => Self::Fetcher,
            Self::Fetcher => Self::Crawler,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one crawl worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    pub role: Role,
    pub index: usize,
}

impl WorkerId {
    pub fn new(role: Role, index: usize) -> Self {
        Self { role, index }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.index)
    }
}

/// Last state reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Registered but not yet running
    Idle,
    /// Loop entered
    Started,
    /// Blocked on its input queue with nothing buffered
    Waiting,
    /// Popped an item
    GotData,
    /// Crawler role: expanding a page bundle
    Crawling,
    /// Fetcher role: transferring a URL
    Downloading,
    /// Fetcher role: parsing downloaded bytes
    Parsing,
    /// About to push to the peer queue
    PushingResult,
    /// Push accepted by the peer queue
    PushedResult,
    /// One cycle completed
    Sleeping,
    /// Left the loop after a stop request
    Stopped,
    /// Left the loop with an error or panic
    Died,
}

impl WorkerState {
    /// Position in the reporting order
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Started => 1,
            Self::Waiting => 2,
            Self::GotData => 3,
            Self::Crawling => 4,
            Self::Downloading => 5,
            Self::Parsing => 6,
            Self::PushingResult => 7,
            Self::PushedResult => 8,
            Self::Sleeping => 9,
            Self::Stopped => 10,
            Self::Died => 11,
        }
    }

    /// Returns true once the worker has left its loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Died)
    }

    /// States that count as idle for end-of-crawl detection
    pub fn is_quiescent(&self) -> bool {
        matches!(self, Self::Waiting | Self::Stopped | Self::Died)
    }

    /// States that count as settled during shutdown
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Stopped | Self::Sleeping | Self::Died)
    }

    /// Returns true for the states that mean "working on an item"
    pub fn is_acting(&self) -> bool {
        matches!(self, Self::Crawling | Self::Downloading | Self::Parsing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Waiting => "waiting",
            Self::GotData => "got_data",
            Self::Crawling => "crawling",
            Self::Downloading => "downloading",
            Self::Parsing => "parsing",
            Self::PushingResult => "pushing_result",
            Self::PushedResult => "pushed_result",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
            Self::Died => "died",
        }
    }

    /// Returns all states in reporting order
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Idle,
            Self::Started,
            Self::Waiting,
            Self::GotData,
            Self::Crawling,
            Self::Downloading,
            Self::Parsing,
            Self::PushingResult,
            Self::PushedResult,
            Self::Sleeping,
            Self::Stopped,
            Self::Died,
        ]
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
