use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Cycle, PUBLICATION_INTERVAL_HOURS, Resolution, ValidHours};
use crate::error::StageError;
use crate::gfs::{Endpoint, ForecastFile, GfsClient};

pub const DEFAULT_MAX_RETREATS: u32 = 4;
pub const DEFAULT_SAFETY_MARGIN_HOURS: i64 = 4;

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub max_retreats: u32,
    pub safety_margin: Duration,
    pub valid_hours: ValidHours,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_retreats: DEFAULT_MAX_RETREATS,
            safety_margin: Duration::hours(DEFAULT_SAFETY_MARGIN_HOURS),
            valid_hours: ValidHours::default(),
        }
    }
}

pub trait CycleProbe {
    fn is_published(&self, cycle: Cycle) -> bool;
}

pub struct UpstreamProbe<'a, C: GfsClient> {
    client: &'a C,
    endpoint: &'a Endpoint,
    resolution: Resolution,
    first_lead: u32,
}

impl<'a, C: GfsClient> UpstreamProbe<'a, C> {
    pub fn new(client: &'a C, endpoint: &'a Endpoint, resolution: Resolution, first_lead: u32) -> Self {
        Self {
            client,
            endpoint,
            resolution,
            first_lead,
        }
    }
}

impl<C: GfsClient> CycleProbe for UpstreamProbe<'_, C> {
    fn is_published(&self, cycle: Cycle) -> bool {
        let file = ForecastFile::new(cycle, self.first_lead, self.resolution);
        let url = self.endpoint.probe_url(&file);
        match self.client.probe(&url) {
            Ok(found) => {
                debug!(%cycle, found, %url, "probe");
                found
            }
            Err(err) => {
                warn!(%cycle, error = %err, "probe failed, treating cycle as unavailable");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedCycle {
    pub requested: Cycle,
    pub cycle: Cycle,
    pub retreats: u32,
    pub probes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial(Cycle),
    Probing { candidate: Cycle, retreats: u32 },
    Resolved { cycle: Cycle, retreats: u32 },
    Fatal { last: Cycle, retreats: u32 },
}

pub struct CycleResolver<'a, P: CycleProbe> {
    probe: &'a P,
    options: ResolverOptions,
}

impl<'a, P: CycleProbe> CycleResolver<'a, P> {
    pub fn new(probe: &'a P, options: ResolverOptions) -> Self {
        Self { probe, options }
    }

    pub fn initial_cycle(&self, explicit: Option<Cycle>, now: DateTime<Utc>) -> Cycle {
        explicit.unwrap_or_else(|| Cycle::snap_down(now - self.options.safety_margin))
    }

    pub fn resolve<F>(&self, initial: Cycle, mut on_retreat: F) -> Result<ResolvedCycle, StageError>
    where
        F: FnMut(Cycle) -> Result<(), StageError>,
    {
        self.check_valid_hours()?;

        let mut probes = 0;
        let mut state = State::Initial(initial);
        loop {
            state = match state {
                State::Initial(cycle) => State::Probing {
                    candidate: self.latest_valid(cycle),
                    retreats: 0,
                },
                State::Probing { candidate, retreats } => {
                    probes += 1;
                    if self.probe.is_published(candidate) {
                        State::Resolved {
                            cycle: candidate,
                            retreats,
                        }
                    } else if retreats >= self.options.max_retreats {
                        State::Fatal {
                            last: candidate,
                            retreats,
                        }
                    } else {
                        let next = self.latest_valid(candidate.retreat());
                        info!(from = %candidate, to = %next, retreat = retreats + 1, "cycle not published, falling back");
                        on_retreat(next)?;
                        State::Probing {
                            candidate: next,
                            retreats: retreats + 1,
                        }
                    }
                }
                State::Resolved { cycle, retreats } => {
                    info!(%cycle, requested = %initial, retreats, "cycle resolved");
                    return Ok(ResolvedCycle {
                        requested: initial,
                        cycle,
                        retreats,
                        probes,
                    });
                }
                State::Fatal { last, retreats } => {
                    return Err(StageError::CycleUnavailable {
                        requested: initial.id(),
                        last_attempted: last.id(),
                        retreats,
                    });
                }
            };
        }
    }

    fn latest_valid(&self, cycle: Cycle) -> Cycle {
        let mut candidate = cycle;
        for _ in 0..cycles_per_day() {
            if self.options.valid_hours.contains(candidate.hour()) {
                return candidate;
            }
            candidate = candidate.retreat();
        }
        candidate
    }

    fn check_valid_hours(&self) -> Result<(), StageError> {
        let any = (0..24)
            .step_by(PUBLICATION_INTERVAL_HOURS as usize)
            .any(|hour| self.options.valid_hours.contains(hour));
        if any {
            Ok(())
        } else {
            Err(StageError::InvalidValidHours(format!(
                "{} contains no publication hour",
                self.options.valid_hours
            )))
        }
    }
}

fn cycles_per_day() -> u32 {
    24 / PUBLICATION_INTERVAL_HOURS
}
