use chrono::{DateTime, Duration, FixedOffset, Utc};
use tracing::{debug, info, warn};

use crate::{
    config::HeatingConfig,
    relay::{RelayDriver, RelayError, RelayOutput},
    schedule::Schedule,
    triggers::TriggerSink,
    types::{Channel, Event, HeatingStatus, TargetSpec, TriggerKind},
};

/// What a `process` pass concluded. Mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    NoTemperature,
    SafetyFloor,
    ForcedOn,
    NoSchedule,
    StaleEvent,
    NotYetDue { due_on: Option<DateTime<Utc>> },
    AboveTarget,
    Proportional { minutes: u32 },
}

#[derive(Debug, Clone)]
pub struct HeatingState {
    pub current_temperature: Option<f32>,
    pub schedule: Option<Schedule>,
    pub desired: TargetSpec,
    pub proportional_minutes: u32,
    pub time_on: Option<DateTime<Utc>>,
    pub time_off: Option<DateTime<Utc>>,
    pub relay_status: bool,
    pub preheat_status: bool,
}

#[derive(Debug, Clone)]
pub struct HeatingEngine {
    config: HeatingConfig,
    state: HeatingState,
}

fn minutes(value: u32) -> Duration {
    Duration::minutes(i64::from(value))
}

impl HeatingEngine {
    pub fn new(mut config: HeatingConfig) -> Self {
        config.sanitize();
        let state = HeatingState {
            current_temperature: None,
            schedule: None,
            desired: TargetSpec::Temperature(config.minimum_temperature),
            proportional_minutes: 0,
            time_on: None,
            time_off: None,
            relay_status: false,
            preheat_status: false,
        };
        Self { config, state }
    }

    pub fn config(&self) -> &HeatingConfig {
        &self.config
    }

    pub fn state(&self) -> &HeatingState {
        &self.state
    }

    pub fn update_temperature(&mut self, temperature: Option<f32>) {
        self.state.current_temperature = temperature.filter(|value| value.is_finite());
    }

    /// Installs a freshly fetched schedule and arms the event trigger at the
    /// next boundary of its head event.
    pub fn update_schedule<T: TriggerSink + ?Sized>(
        &mut self,
        schedule: Schedule,
        now: DateTime<Utc>,
        triggers: &mut T,
    ) {
        let previous_head = self.state.schedule.as_ref().and_then(|s| s.head().copied());
        let head = schedule.head().copied();
        if head != previous_head {
            match head {
                Some(event) => info!(
                    "new event {} to {}: {}",
                    event.start, event.end, event.target
                ),
                None => info!("no upcoming events"),
            }
            self.state.time_off = None;
        }

        match schedule.next_boundary(now) {
            Some(at) => triggers.schedule(TriggerKind::Event, at),
            None => triggers.cancel(TriggerKind::Event),
        }
        self.state.schedule = Some(schedule);
    }

    /// Re-evaluates the relay channels for `now`.
    ///
    /// A relay command failure ends the pass early; the failed transition is
    /// not recorded, so the next pass retries it. A failed resync is reported
    /// after the decision has been applied.
    pub fn process<D, T>(
        &mut self,
        now: DateTime<Utc>,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<Decision, RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        let Some(current) = self.state.current_temperature else {
            debug!("no temperature yet, skipping");
            return Ok(Decision::NoTemperature);
        };

        self.state.relay_status = relay.status(Channel::Heating);
        self.state.preheat_status = relay.status(Channel::Preheat);

        let decision = self.decide(current, now, relay, triggers)?;
        debug!(
            "process at {now}: {decision:?}, current {current}, desired {}",
            self.state.desired
        );

        // Hardware commands are idempotent, so this only sends on divergence.
        relay.resync()?;
        Ok(decision)
    }

    fn decide<D, T>(
        &mut self,
        current: f32,
        now: DateTime<Utc>,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<Decision, RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        let interval = self.config.proportional_heating_interval_minutes;
        let minimum = self.config.minimum_temperature;

        if current < minimum {
            info!("temperature {current} below minimum {minimum}");
            self.state.desired = TargetSpec::Temperature(minimum);
            self.heating_on(interval, Some(now + minutes(interval)), now, relay, triggers)?;
            return Ok(Decision::SafetyFloor);
        }

        let schedule = self.state.schedule.clone().unwrap_or_default();

        match schedule.active_preheat(now).copied() {
            Some(window) if !self.state.preheat_status => {
                self.preheat_on(window.end, relay, triggers)?;
            }
            None if self.state.preheat_status => self.preheat_off(relay, triggers)?,
            _ => {}
        }

        let forced = schedule.active_forced_on(now).is_some();
        if forced && !self.state.relay_status {
            self.heating_on(interval, None, now, relay, triggers)?;
        }

        let Some(event) = schedule.first_temperature().copied() else {
            if forced {
                self.state.desired = TargetSpec::ForcedOn;
                return Ok(Decision::ForcedOn);
            }
            self.state.desired = TargetSpec::Temperature(minimum);
            self.heating_off(0, None, now, relay, triggers)?;
            return Ok(Decision::NoSchedule);
        };

        self.state.desired = event.target;
        if forced {
            return Ok(Decision::ForcedOn);
        }
        if event.end < now {
            self.heating_off(0, None, now, relay, triggers)?;
            return Ok(Decision::StaleEvent);
        }

        self.proportional(&schedule, event, current, now, relay, triggers)
    }

    fn proportional<D, T>(
        &mut self,
        schedule: &Schedule,
        event: Event,
        current: f32,
        now: DateTime<Utc>,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<Decision, RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        let interval = self.config.proportional_heating_interval_minutes;
        let target = event.target.temperature().unwrap_or(self.config.minimum_temperature);

        let mut operative = event;
        let mut temp_diff = target - current;
        let mut time_due_on = (event.start < now).then_some(event.start);
        let mut warming_up = false;

        for candidate in schedule.temperature_events() {
            if candidate.start <= now {
                continue;
            }
            let Some(candidate_target) = candidate.target.temperature() else {
                continue;
            };
            let diff = candidate_target - current;
            if diff <= 0.0 {
                continue;
            }

            let lead_minutes =
                diff * self.config.minutes_per_degree + self.config.effect_delay_minutes;
            // A lead beyond the calendar range means the window is due already.
            let due = Duration::try_seconds((lead_minutes * 60.0).round() as i64)
                .and_then(|lead| candidate.start.checked_sub_signed(lead))
                .unwrap_or_else(|| {
                    warn!("warm-up lead for {} is out of range", candidate.target);
                    DateTime::<Utc>::MIN_UTC
                });
            // Ties keep the earlier candidate.
            if time_due_on.map_or(true, |best| due < best) {
                time_due_on = Some(due);
                operative = *candidate;
                temp_diff = diff;
                warming_up = true;
            }
        }

        if warming_up {
            self.state.desired = operative.target;
        }

        let due_on = match time_due_on {
            Some(due_on) if due_on <= now => due_on,
            pending => {
                self.heating_off(0, pending, now, relay, triggers)?;
                return Ok(Decision::NotYetDue { due_on: pending });
            }
        };
        debug!("heating due on since {due_on}, deficit {temp_diff}");

        if temp_diff <= 0.0 {
            self.heating_off(0, None, now, relay, triggers)?;
            return Ok(Decision::AboveTarget);
        }

        let new_minutes = if warming_up && temp_diff > self.config.warmup_full_duty_threshold {
            interval
        } else {
            self.duty_minutes(temp_diff)
        };
        let old_minutes = self.state.proportional_minutes;

        if !self.state.relay_status {
            let due_on = match self.state.time_off {
                Some(off) => off + minutes(interval - new_minutes),
                None => now,
            };
            if due_on <= now {
                let due_off = self.due_off(now, new_minutes, operative.end);
                self.heating_on(new_minutes, Some(due_off), now, relay, triggers)?;
            } else {
                if new_minutes != old_minutes {
                    debug!("proportion {old_minutes} -> {new_minutes}, next on at {due_on}");
                    self.state.proportional_minutes = new_minutes;
                }
                triggers.schedule(TriggerKind::Heating, due_on);
            }
        } else {
            let anchor = self.state.time_on.unwrap_or(now);
            let due_off = self.due_off(anchor, new_minutes, operative.end);
            if due_off <= now {
                let next_on = now + minutes(interval - new_minutes);
                self.heating_off(new_minutes, Some(next_on), now, relay, triggers)?;
            } else {
                if new_minutes != old_minutes {
                    debug!("proportion {old_minutes} -> {new_minutes}, next off at {due_off}");
                    self.state.proportional_minutes = new_minutes;
                }
                // Forced-on passes leave no heating trigger behind.
                triggers.schedule(TriggerKind::Heating, due_off);
            }
        }

        Ok(Decision::Proportional {
            minutes: new_minutes,
        })
    }

    /// `deficit * interval / divisor`, clamped to the worthwhile burst range.
    pub fn duty_minutes(&self, temp_diff: f32) -> u32 {
        let interval = self.config.proportional_heating_interval_minutes as f32;
        let floor = self.config.minimum_active_period_minutes as f32;
        let raw = temp_diff * interval / self.config.proportional_divisor;
        raw.clamp(floor, interval).round() as u32
    }

    /// Full duty runs until the event ends rather than for one interval.
    fn due_off(
        &self,
        anchor: DateTime<Utc>,
        duty: u32,
        event_end: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if duty >= self.config.proportional_heating_interval_minutes {
            event_end
        } else {
            anchor + minutes(duty)
        }
    }

    fn heating_on<D, T>(
        &mut self,
        duty: u32,
        trigger_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<(), RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        relay.on(Channel::Heating)?;
        if !self.state.relay_status {
            info!(
                "heating on for {duty} of {} minutes",
                self.config.proportional_heating_interval_minutes
            );
            self.state.time_on = Some(now);
            self.state.time_off = None;
        }
        self.state.relay_status = true;
        self.state.proportional_minutes = duty;
        match trigger_at {
            Some(at) => triggers.schedule(TriggerKind::Heating, at),
            None => triggers.cancel(TriggerKind::Heating),
        }
        Ok(())
    }

    fn heating_off<D, T>(
        &mut self,
        duty: u32,
        trigger_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<(), RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        relay.off(Channel::Heating)?;
        if self.state.relay_status {
            info!("heating off, duty {duty} minutes");
            self.state.time_off = Some(now);
            self.state.time_on = None;
        }
        self.state.relay_status = false;
        self.state.proportional_minutes = duty;
        match trigger_at {
            Some(at) => triggers.schedule(TriggerKind::Heating, at),
            None => triggers.cancel(TriggerKind::Heating),
        }
        Ok(())
    }

    fn preheat_on<D, T>(
        &mut self,
        until: DateTime<Utc>,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<(), RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        relay.on(Channel::Preheat)?;
        info!("preheat on until {until}");
        self.state.preheat_status = true;
        triggers.schedule(TriggerKind::Preheat, until);
        Ok(())
    }

    fn preheat_off<D, T>(
        &mut self,
        relay: &RelayOutput<D>,
        triggers: &mut T,
    ) -> Result<(), RelayError>
    where
        D: RelayDriver,
        T: TriggerSink + ?Sized,
    {
        relay.off(Channel::Preheat)?;
        info!("preheat off");
        self.state.preheat_status = false;
        triggers.cancel(TriggerKind::Preheat);
        Ok(())
    }

    pub fn status(
        &self,
        outside_temp: Option<f32>,
        timezone: &str,
        offset: &FixedOffset,
    ) -> HeatingStatus {
        let render = |at: Option<DateTime<Utc>>| at.map(|at| at.with_timezone(offset).to_rfc3339());
        HeatingStatus {
            current_temp: self.state.current_temperature,
            desired_temp: self.state.desired.to_string(),
            proportional_minutes: self.state.proportional_minutes,
            heating_on: self.state.relay_status,
            preheat_on: self.state.preheat_status,
            time_on: render(self.state.time_on),
            time_off: render(self.state.time_off),
            events: self
                .state
                .schedule
                .as_ref()
                .map(|schedule| schedule.events().to_vec())
                .unwrap_or_default(),
            outside_temp,
            timezone: timezone.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        relay::fake::{output, Command, FakeDriver},
        schedule::CalendarEntry,
        triggers::fake::RecordingTriggers,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 7, 0, 0).unwrap()
    }

    fn at(offset_minutes: i64) -> DateTime<Utc> {
        now() + Duration::minutes(offset_minutes)
    }

    fn event(start: i64, end: i64, target: TargetSpec) -> Event {
        Event::new(at(start), at(end), target)
    }

    struct Rig {
        engine: HeatingEngine,
        relay: RelayOutput<FakeDriver>,
        driver: FakeDriver,
        triggers: RecordingTriggers,
    }

    impl Rig {
        fn new(config: HeatingConfig) -> Self {
            let (relay, driver) = output();
            Self {
                engine: HeatingEngine::new(config),
                relay,
                driver,
                triggers: RecordingTriggers::default(),
            }
        }

        fn with_defaults() -> Self {
            Self::new(HeatingConfig::default())
        }

        fn schedule(&mut self, events: Vec<Event>) {
            let max = self.engine.config.max_events;
            self.engine
                .update_schedule(Schedule::new(events, max), now(), &mut self.triggers);
        }

        fn process_at(&mut self, when: DateTime<Utc>) -> Decision {
            self.engine
                .process(when, &self.relay, &mut self.triggers)
                .unwrap()
        }

        fn process(&mut self) -> Decision {
            self.process_at(now())
        }
    }

    #[test]
    fn no_temperature_is_a_no_op() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);

        assert_eq!(rig.process(), Decision::NoTemperature);
        assert!(rig.driver.commands().is_empty());
    }

    #[test]
    fn scenario_a_safety_floor_runs_full_interval() {
        let mut rig = Rig::new(HeatingConfig {
            proportional_heating_interval_minutes: 30,
            ..HeatingConfig::default()
        });
        rig.engine.update_temperature(Some(5.0));

        assert_eq!(rig.process(), Decision::SafetyFloor);
        assert!(rig.engine.state().relay_status);
        assert_eq!(rig.engine.state().proportional_minutes, 30);
        assert_eq!(rig.engine.state().desired, TargetSpec::Temperature(9.0));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(30)));
    }

    #[test]
    fn safety_floor_ignores_schedule() {
        for events in [
            vec![],
            vec![event(-10, 50, TargetSpec::Temperature(5.0))],
            vec![event(-10, 50, TargetSpec::Preheat)],
        ] {
            let mut rig = Rig::with_defaults();
            rig.schedule(events);
            rig.engine.update_temperature(Some(8.9));

            assert_eq!(rig.process(), Decision::SafetyFloor);
            assert!(rig.relay.status(Channel::Heating));
            assert_eq!(rig.engine.state().proportional_minutes, 20);
        }
    }

    #[test]
    fn scenario_b_small_deficit_runs_proportional_duty() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));

        assert_eq!(rig.process(), Decision::Proportional { minutes: 10 });
        assert_eq!(rig.driver.commands(), vec![Command::On(Channel::Heating)]);
        assert_eq!(rig.engine.state().time_on, Some(now()));
        assert_eq!(rig.engine.state().time_off, None);
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(10)));
        assert_eq!(rig.engine.state().desired.to_string(), "20");
    }

    #[test]
    fn scenario_c_above_target_turns_off() {
        let mut rig = Rig::with_defaults();
        rig.relay.on(Channel::Heating).unwrap();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(15.0))]);
        rig.engine.update_temperature(Some(16.0));

        assert_eq!(rig.process(), Decision::AboveTarget);
        assert!(!rig.relay.status(Channel::Heating));
        assert_eq!(rig.engine.state().proportional_minutes, 0);
        assert_eq!(rig.triggers.at(TriggerKind::Heating), None);
    }

    #[test]
    fn target_at_or_below_current_is_always_off() {
        for current in [15.0, 15.5, 18.0, 25.0] {
            let mut rig = Rig::with_defaults();
            rig.relay.on(Channel::Heating).unwrap();
            rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(15.0))]);
            rig.engine.update_temperature(Some(current));

            rig.process();
            assert!(!rig.relay.status(Channel::Heating), "current {current}");
        }
    }

    #[test]
    fn scenario_d_warm_up_lookahead_runs_full_duty() {
        let mut rig = Rig::new(HeatingConfig {
            minutes_per_degree: 25.0,
            effect_delay_minutes: 20.0,
            ..HeatingConfig::default()
        });
        rig.schedule(vec![event(40, 100, TargetSpec::Temperature(21.0))]);
        rig.engine.update_temperature(Some(18.0));

        assert_eq!(rig.process(), Decision::Proportional { minutes: 20 });
        assert!(rig.relay.status(Channel::Heating));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(100)));
    }

    #[test]
    fn out_of_range_warm_up_target_heats_at_full_duty() {
        let mut rig = Rig::with_defaults();
        let entries = [CalendarEntry {
            start: at(60),
            end: at(120),
            summary: "1e10".to_string(),
        }];
        let schedule = Schedule::from_entries(&entries, now(), 3);
        rig.engine
            .update_schedule(schedule, now(), &mut rig.triggers);
        rig.engine.update_temperature(Some(19.0));

        assert_eq!(rig.process(), Decision::Proportional { minutes: 20 });
        assert!(rig.relay.status(Channel::Heating));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(120)));
    }

    #[test]
    fn warm_up_not_due_waits_and_arms_trigger() {
        let mut rig = Rig::with_defaults();
        // 1 degree short: lead is 25 + 20 = 45 minutes before the start.
        rig.schedule(vec![event(120, 180, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));

        assert_eq!(
            rig.process(),
            Decision::NotYetDue {
                due_on: Some(at(75))
            }
        );
        assert!(!rig.relay.status(Channel::Heating));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(75)));

        assert_eq!(
            rig.process_at(at(75)),
            Decision::Proportional { minutes: 20 }
        );
        assert!(rig.relay.status(Channel::Heating));
    }

    #[test]
    fn small_warm_up_deficit_keeps_proportional_duty() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(10, 70, TargetSpec::Temperature(19.2))]);
        rig.engine.update_temperature(Some(19.0));

        assert_eq!(rig.process(), Decision::Proportional { minutes: 8 });
    }

    #[test]
    fn earliest_warm_up_candidate_wins() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![
            event(-10, 30, TargetSpec::Temperature(19.5)),
            event(60, 120, TargetSpec::Temperature(22.0)),
        ]);
        rig.engine.update_temperature(Some(19.0));

        // 3 degrees for the second window: 95 minute lead puts it at -35.
        assert_eq!(rig.process(), Decision::Proportional { minutes: 20 });
        assert_eq!(rig.engine.state().desired, TargetSpec::Temperature(22.0));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(120)));
    }

    #[test]
    fn scenario_e_forced_on_ignores_temperature() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-5, 60, TargetSpec::ForcedOn)]);
        rig.engine.update_temperature(Some(30.0));

        assert_eq!(rig.process(), Decision::ForcedOn);
        assert!(rig.relay.status(Channel::Heating));
        assert_eq!(rig.engine.state().proportional_minutes, 20);
        assert_eq!(rig.engine.state().desired.to_string(), "On");
        assert_eq!(rig.triggers.at(TriggerKind::Heating), None);
    }

    #[test]
    fn forced_on_suppresses_proportional_branch() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![
            event(-5, 60, TargetSpec::ForcedOn),
            event(-5, 60, TargetSpec::Temperature(15.0)),
        ]);
        rig.engine.update_temperature(Some(20.0));

        assert_eq!(rig.process(), Decision::ForcedOn);
        assert!(rig.relay.status(Channel::Heating));

        // Window over: the next pass falls through to the temperature event.
        rig.schedule(vec![event(-5, 60, TargetSpec::Temperature(15.0))]);
        assert_eq!(rig.process_at(at(1)), Decision::AboveTarget);
        assert!(!rig.relay.status(Channel::Heating));
    }

    #[test]
    fn preheat_window_switches_channel_and_arms_end() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-5, 25, TargetSpec::Preheat)]);
        rig.engine.update_temperature(Some(20.0));

        assert_eq!(rig.process(), Decision::NoSchedule);
        assert!(rig.relay.status(Channel::Preheat));
        assert!(!rig.relay.status(Channel::Heating));
        assert_eq!(rig.triggers.at(TriggerKind::Preheat), Some(at(25)));

        assert_eq!(rig.process_at(at(25)), Decision::NoSchedule);
        assert!(!rig.relay.status(Channel::Preheat));
        assert_eq!(rig.triggers.at(TriggerKind::Preheat), None);
    }

    #[test]
    fn no_events_turns_heating_off_at_minimum_target() {
        let mut rig = Rig::with_defaults();
        rig.relay.on(Channel::Heating).unwrap();
        rig.schedule(vec![]);
        rig.engine.update_temperature(Some(12.0));

        assert_eq!(rig.process(), Decision::NoSchedule);
        assert!(!rig.relay.status(Channel::Heating));
        assert_eq!(rig.engine.state().desired, TargetSpec::Temperature(9.0));
    }

    #[test]
    fn elapsed_event_is_treated_as_stale() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-60, -5, TargetSpec::Temperature(22.0))]);
        rig.engine.update_temperature(Some(18.0));

        assert_eq!(rig.process(), Decision::StaleEvent);
        assert!(!rig.relay.status(Channel::Heating));
    }

    #[test]
    fn second_pass_sends_no_relay_command() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));

        rig.process();
        let first = rig.driver.commands();
        let state = rig.engine.state().clone();
        rig.process();

        assert_eq!(rig.driver.commands(), first);
        assert_eq!(rig.engine.state().relay_status, state.relay_status);
        assert_eq!(rig.engine.state().proportional_minutes, state.proportional_minutes);
        assert_eq!(rig.engine.state().time_on, state.time_on);
    }

    #[test]
    fn duty_is_clamped_to_active_range() {
        let engine = HeatingEngine::new(HeatingConfig::default());
        let mut deficit = 0.05_f32;
        while deficit < 10.0 {
            let minutes = engine.duty_minutes(deficit);
            assert!((8..=20).contains(&minutes), "deficit {deficit} gave {minutes}");
            deficit += 0.05;
        }
        assert_eq!(engine.duty_minutes(1.0), 10);
        assert_eq!(engine.duty_minutes(0.1), 8);
        assert_eq!(engine.duty_minutes(5.0), 20);
    }

    #[test]
    fn duty_cycle_turns_off_then_back_on() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 180, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));

        rig.process();
        assert!(rig.relay.status(Channel::Heating));

        // The heating trigger fires at the end of the 10 minute burst.
        assert_eq!(rig.process_at(at(10)), Decision::Proportional { minutes: 10 });
        assert!(!rig.relay.status(Channel::Heating));
        assert_eq!(rig.engine.state().time_off, Some(at(10)));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(20)));

        rig.process_at(at(15));
        assert!(!rig.relay.status(Channel::Heating));

        rig.process_at(at(20));
        assert!(rig.relay.status(Channel::Heating));
        assert_eq!(rig.engine.state().time_on, Some(at(20)));
    }

    #[test]
    fn larger_deficit_while_off_retargets_trigger() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 180, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        rig.process();
        rig.process_at(at(10));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(20)));

        // 1.5 degrees short: 15 minute duty is due 5 minutes after going off.
        rig.engine.update_temperature(Some(18.5));
        rig.process_at(at(12));
        assert!(!rig.relay.status(Channel::Heating));
        assert_eq!(rig.engine.state().proportional_minutes, 15);
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(15)));

        rig.process_at(at(15));
        assert!(rig.relay.status(Channel::Heating));
    }

    #[test]
    fn new_head_event_restarts_duty_cycle() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 180, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        rig.process();
        rig.process_at(at(10));
        assert!(!rig.relay.status(Channel::Heating));

        rig.schedule(vec![event(-10, 180, TargetSpec::Temperature(21.0))]);
        assert_eq!(rig.engine.state().time_off, None);

        rig.process_at(at(11));
        assert!(rig.relay.status(Channel::Heating));
    }

    #[test]
    fn schedule_update_arms_event_trigger() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(30, 90, TargetSpec::Temperature(20.0))]);
        assert_eq!(rig.triggers.at(TriggerKind::Event), Some(at(30)));

        rig.schedule(vec![]);
        assert_eq!(rig.triggers.at(TriggerKind::Event), None);
    }

    #[test]
    fn at_most_one_trigger_per_concern() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 180, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        for step in 0..40 {
            rig.process_at(at(step * 3));
        }

        assert!(rig.triggers.scheduled > 3);
        assert!(rig.triggers.pending.len() <= 3);
    }

    #[test]
    fn relay_failure_keeps_logical_state() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        rig.driver.set_failing(true);

        let err = rig
            .engine
            .process(now(), &rig.relay, &mut rig.triggers)
            .unwrap_err();
        assert!(matches!(err, RelayError::Command { .. }));
        assert!(!rig.engine.state().relay_status);
        assert_eq!(rig.engine.state().time_on, None);

        rig.driver.set_failing(false);
        assert_eq!(rig.process_at(at(1)), Decision::Proportional { minutes: 10 });
        assert!(rig.engine.state().relay_status);
    }

    #[test]
    fn process_resyncs_diverged_preheat_channel() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        rig.process();

        // Board came back from a brown-out with the preheat latch set.
        rig.driver.set_hardware(Channel::Preheat, true);
        rig.process_at(at(1));

        assert_eq!(
            rig.driver.commands(),
            vec![Command::On(Channel::Heating), Command::Off(Channel::Preheat)]
        );
        assert!(!rig.engine.state().preheat_status);
    }

    #[test]
    fn failed_resync_is_reported() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        rig.process();

        rig.driver.set_hardware(Channel::Preheat, true);
        rig.driver.set_failing(true);
        let err = rig
            .engine
            .process(at(1), &rig.relay, &mut rig.triggers)
            .unwrap_err();

        assert_eq!(
            err,
            RelayError::Command {
                channel: Channel::Preheat,
                reason: "usb timeout".to_string(),
            }
        );
        assert!(rig.engine.state().relay_status);
    }

    #[test]
    fn repeated_on_keeps_anchor_and_rearms_trigger() {
        let mut rig = Rig::with_defaults();
        rig.engine.update_temperature(Some(5.0));
        rig.process();
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(20)));

        rig.process_at(at(5));

        assert_eq!(rig.engine.state().time_on, Some(now()));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(25)));
        assert_eq!(rig.driver.commands(), vec![Command::On(Channel::Heating)]);
    }

    #[test]
    fn full_duty_after_forced_window_arms_switch_off() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![
            event(-10, 10, TargetSpec::ForcedOn),
            event(-10, 120, TargetSpec::Temperature(22.0)),
        ]);
        rig.engine.update_temperature(Some(18.0));
        assert_eq!(rig.process(), Decision::ForcedOn);
        assert_eq!(rig.triggers.at(TriggerKind::Heating), None);

        assert_eq!(
            rig.process_at(at(10)),
            Decision::Proportional { minutes: 20 }
        );
        assert!(rig.relay.status(Channel::Heating));
        assert_eq!(rig.triggers.at(TriggerKind::Heating), Some(at(120)));
    }

    #[test]
    fn status_renders_anchors_in_offset() {
        let mut rig = Rig::with_defaults();
        rig.schedule(vec![event(-10, 50, TargetSpec::Temperature(20.0))]);
        rig.engine.update_temperature(Some(19.0));
        rig.process();

        let offset = FixedOffset::east_opt(3600).unwrap();
        let status = rig.engine.status(Some(4.5), "Europe/Paris", &offset);

        assert_eq!(status.time_on.as_deref(), Some("2026-01-05T08:00:00+01:00"));
        assert_eq!(status.desired_temp, "20");
        assert_eq!(status.proportional_minutes, 10);
        assert_eq!(status.events.len(), 1);
        assert_eq!(status.outside_temp, Some(4.5));
    }
}
