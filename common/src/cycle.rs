use rand::{rngs::StdRng, Rng, SeedableRng};

/// Source of the random offset added to the fetch interval.
pub trait JitterSource {
    /// Returns a value in `0..spread`, or 0 when `spread` is 0.
    fn draw(&mut self, spread: u32) -> u32;
}

#[derive(Debug, Clone)]
pub struct RandomJitter {
    rng: StdRng,
}

impl RandomJitter {
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl JitterSource for RandomJitter {
    fn draw(&mut self, spread: u32) -> u32 {
        if spread == 0 {
            return 0;
        }
        self.rng.random_range(0..spread)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleState {
    pub cycles_since_fetch: u32,
    pub cycles_until_fetch: u32,
    pub schedule_loaded: bool,
}

#[derive(Debug, Clone)]
pub struct CycleScheduler<J> {
    state: CycleState,
    jitter_base: u32,
    jitter_spread: u32,
    jitter: J,
}

impl<J: JitterSource> CycleScheduler<J> {
    pub fn new(jitter_base: u32, jitter_spread: u32, jitter: J) -> Self {
        Self {
            state: CycleState {
                cycles_since_fetch: 0,
                cycles_until_fetch: jitter_base,
                schedule_loaded: false,
            },
            jitter_base,
            jitter_spread,
            jitter,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Advances one tick and reports whether a fetch is due.
    pub fn advance(&mut self) -> bool {
        if !self.state.schedule_loaded {
            return true;
        }
        self.state.cycles_since_fetch = self.state.cycles_since_fetch.saturating_add(1);
        self.state.cycles_since_fetch >= self.state.cycles_until_fetch
    }

    pub fn mark_loaded(&mut self) {
        self.state.schedule_loaded = true;
    }

    /// Resets the fetch countdown. Called on completion, never on issue.
    pub fn on_fetch_completed(&mut self) {
        self.state.cycles_since_fetch = 0;
        self.state.cycles_until_fetch = self
            .jitter_base
            .saturating_add(self.jitter.draw(self.jitter_spread));
    }
}
