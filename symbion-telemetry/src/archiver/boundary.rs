use serde::Serialize;

use crate::models::{Tier, Timestamp, HOUR_MS, MINUTE_MS};

/// Period of each rollup boundary, indexed by destination tier.
pub const MINUTE_PERIOD_MS: i64 = MINUTE_MS;
pub const TWENTY_MINUTES_PERIOD_MS: i64 = 20 * MINUTE_MS;
pub const TWO_HOURS_PERIOD_MS: i64 = 2 * HOUR_MS;

pub fn truncate(ts: Timestamp, period_ms: i64) -> Timestamp {
    ts - ts.rem_euclid(period_ms)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Une passe d'archivage : la passe minute, et éventuellement les passes imbriquées
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassPlan {
    pub minute: Window,
    pub twenty_minutes: Option<Window>,
    pub two_hours: Option<Window>,
}

impl PassPlan {
    /// Frontière déclenchante, aussi celle de l'évaluation des alertes
    pub fn boundary(&self) -> Timestamp {
        self.minute.end
    }

    pub fn rollups(&self) -> Vec<(Tier, Tier, Window)> {
        let mut out = vec![(Tier::FiveSeconds, Tier::OneMinute, self.minute)];
        if let Some(w) = self.twenty_minutes {
            out.push((Tier::OneMinute, Tier::TwentyMinutes, w));
        }
        if let Some(w) = self.two_hours {
            out.push((Tier::TwentyMinutes, Tier::TwoHours, w));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct BoundaryTracker {
    last_minute: Timestamp,
    last_twenty_minutes: Timestamp,
    last_two_hours: Timestamp,
}

impl BoundaryTracker {
    /// Le premier passage rejoue la dernière fenêtre de chaque tier : une fenêtre
    /// laissée en suspens par un arrêt est archivée au redémarrage
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            last_minute: truncate(now, MINUTE_PERIOD_MS) - MINUTE_PERIOD_MS,
            last_twenty_minutes: truncate(now, TWENTY_MINUTES_PERIOD_MS) - TWENTY_MINUTES_PERIOD_MS,
            last_two_hours: truncate(now, TWO_HOURS_PERIOD_MS) - TWO_HOURS_PERIOD_MS,
        }
    }

    /// Passe à lancer si la frontière minute a bougé depuis le dernier appel ;
    /// les passes grossières ne sont envisagées que dans une passe minute
    pub fn advance(&mut self, now: Timestamp) -> Option<PassPlan> {
        let minute = truncate(now, MINUTE_PERIOD_MS);
        if minute <= self.last_minute {
            return None;
        }
        let mut plan = PassPlan {
            minute: Window {
                start: self.last_minute,
                end: minute,
            },
            twenty_minutes: None,
            two_hours: None,
        };
        self.last_minute = minute;

        let twenty = truncate(now, TWENTY_MINUTES_PERIOD_MS);
        if twenty > self.last_twenty_minutes {
            plan.twenty_minutes = Some(Window {
                start: self.last_twenty_minutes,
                end: twenty,
            });
            self.last_twenty_minutes = twenty;

            let two_hours = truncate(now, TWO_HOURS_PERIOD_MS);
            if two_hours > self.last_two_hours {
                plan.two_hours = Some(Window {
                    start: self.last_two_hours,
                    end: two_hours,
                });
                self.last_two_hours = two_hours;
            }
        }
        Some(plan)
    }
}
