//! Bridge exercise scenarios.
//!
//! Each scenario wires a scripted world and server fault plan to a
//! [`BridgeHost`] over an in-process link, runs the full protocol, and checks
//! the run report against the scenario's expectations. Everything is
//! deterministic per seed.

use std::time::Duration;

use nalgebra::Vector3;
use tracing::info;

use steplink_core::messages::SimulationStatus;
use steplink_core::{MemoryLink, RunEnd, RunSettings, Transport, TransportConfig};

use crate::host::{derive_run_id, AppProbe, BlueprintFactory, BridgeHost, NodeBlueprint, RunReport};
use crate::server::{ServerScript, ServerStats, WorldServer};
use crate::world::{WorldEntity, WorldModel};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Fixed entity set to a clean cooperative finish
    SteadyState,

    /// Entities spawning and despawning mid-run
    Churn,

    /// An entity entering the world after the handshake
    LateJoin,

    /// Authoritative side reports an accident mid-run
    Accident,

    /// Announced time limit enforced by the authoritative side
    TimeLimit,

    /// Authoritative side goes silent mid-run
    Stall,

    /// Snapshot delivers a kind with no blueprint
    UnknownKind,

    /// Application relay exercised every few ticks
    LightControl,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::Churn,
            ScenarioId::LateJoin,
            ScenarioId::Accident,
            ScenarioId::TimeLimit,
            ScenarioId::Stall,
            ScenarioId::UnknownKind,
            ScenarioId::LightControl,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::Churn => "churn",
            ScenarioId::LateJoin => "late_join",
            ScenarioId::Accident => "accident",
            ScenarioId::TimeLimit => "time_limit",
            ScenarioId::Stall => "stall",
            ScenarioId::UnknownKind => "unknown_kind",
            ScenarioId::LightControl => "light_control",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "Track a fixed entity set to a clean FINISHED_OK",
            ScenarioId::Churn => "Spawn/despawn windows force creates and destroys every few ticks",
            ScenarioId::LateJoin => "An entity appears mid-run and must be instantiated on sight",
            ScenarioId::Accident => "FINISHED_ACCIDENT mid-run ends the bridge without an error",
            ScenarioId::TimeLimit => "The announced time limit terminates the run authoritatively",
            ScenarioId::Stall => "A silent peer must surface a step timeout and stop the bridge",
            ScenarioId::UnknownKind => "A kind without a blueprint must fail fast, destroying nothing",
            ScenarioId::LightControl => "Traffic-light payloads ride the relay between ticks",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_state" | "steadystate" | "steady" => Ok(ScenarioId::SteadyState),
            "churn" => Ok(ScenarioId::Churn),
            "late_join" | "latejoin" => Ok(ScenarioId::LateJoin),
            "accident" => Ok(ScenarioId::Accident),
            "time_limit" | "timelimit" => Ok(ScenarioId::TimeLimit),
            "stall" => Ok(ScenarioId::Stall),
            "unknown_kind" | "unknownkind" => Ok(ScenarioId::UnknownKind),
            "light_control" | "lightcontrol" => Ok(ScenarioId::LightControl),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    pub passed: bool,
    pub failure_reason: Option<String>,
    pub report: RunReport,
}

/// Runs one scenario end to end over an in-process link.
pub fn run_scenario(scenario: ScenarioId, seed: u64) -> ScenarioResult {
    info!(scenario = %scenario, seed, "scenario starting");

    let step_size = Duration::from_millis(100);
    // Physics stream decoupled from the master seed so scenario edits do not
    // shift trajectories.
    let physics_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);
    let mut world = WorldModel::new(physics_seed);
    let mut script = ServerScript::default();
    let mut settings = RunSettings {
        run_id: derive_run_id(seed),
        seed,
        step_size,
        time_limit: None,
        extra_init: serde_json::json!({ "scenario": scenario.name() }),
    };
    let mut probe: Option<AppProbe> = None;
    let mut predeclared: Vec<&'static str> = Vec::new();

    match scenario {
        ScenarioId::SteadyState => {
            world.insert(WorldEntity::cruising(
                "ego",
                "car",
                Vector3::zeros(),
                Vector3::new(12.0, 0.0, 0.0),
            ));
            world.populate_cruisers(2, "car");
            script.finish = Some((20, SimulationStatus::FinishedOk));
            predeclared.push("ego");
        }
        ScenarioId::Churn => {
            world.populate_cruisers(2, "car");
            world.insert(
                WorldEntity::cruising("brief", "car", Vector3::zeros(), Vector3::new(2.0, 0.0, 0.0))
                    .window(0.25, Some(0.65)),
            );
            world.insert(
                WorldEntity::cruising(
                    "late-0",
                    "bicycle",
                    Vector3::new(50.0, 0.0, 0.0),
                    Vector3::new(0.0, 4.0, 0.0),
                )
                .window(0.45, Some(1.5)),
            );
            world.insert(
                WorldEntity::cruising(
                    "late-1",
                    "car",
                    Vector3::new(-50.0, 0.0, 0.0),
                    Vector3::new(8.0, 0.0, 0.0),
                )
                .window(0.75, None),
            );
            script.finish = Some((25, SimulationStatus::FinishedOk));
        }
        ScenarioId::LateJoin => {
            world.populate_cruisers(1, "car");
            world.insert(
                WorldEntity::cruising("joiner", "car", Vector3::zeros(), Vector3::new(6.0, 0.0, 0.0))
                    .window(0.55, None),
            );
            script.finish = Some((15, SimulationStatus::FinishedOk));
        }
        ScenarioId::Accident => {
            world.populate_cruisers(3, "car");
            script.finish = Some((12, SimulationStatus::FinishedAccident));
        }
        ScenarioId::TimeLimit => {
            world.populate_cruisers(2, "car");
            settings.time_limit = Some(Duration::from_secs(1));
        }
        ScenarioId::Stall => {
            world.populate_cruisers(2, "car");
            script.stall_at_step = Some(5);
        }
        ScenarioId::UnknownKind => {
            world.populate_cruisers(2, "car");
            world.insert(
                WorldEntity::cruising("ghost", "hovercraft", Vector3::zeros(), Vector3::zeros())
                    .window(0.35, None),
            );
        }
        ScenarioId::LightControl => {
            world.populate_cruisers(2, "car");
            script.finish = Some((12, SimulationStatus::FinishedOk));
            probe = Some(AppProbe {
                every: 3,
                payload: serde_json::json!({ "light_next_state": "green" }),
            });
        }
    }

    let factory = BlueprintFactory::new(step_size)
        .with_blueprint("car", NodeBlueprint::new("steplink.node.Car", "car[*]"))
        .with_blueprint("bicycle", NodeBlueprint::new("steplink.node.Bicycle", "bicycle[*]"));
    let models: Vec<_> = predeclared
        .iter()
        .filter_map(|id| factory.node(id, "car"))
        .collect();

    let (client, server_link) = MemoryLink::pair();
    let transport_config = TransportConfig {
        timeout: Duration::from_millis(200),
        floor_timeout: Duration::from_millis(100),
        ..TransportConfig::default()
    };
    let server = WorldServer::new(server_link, world, script).spawn();

    let mut host = BridgeHost::new(
        Transport::new(Box::new(client), &transport_config),
        factory,
        settings,
    )
    .with_max_steps(200);
    if let Some(probe) = probe {
        host = host.with_probe(probe);
    }
    for model in models {
        host.declare(model).expect("pre-declaration before start");
    }

    let report = host.run();
    let stats = server.join().expect("world server panicked");

    let failure_reason = evaluate(scenario, &report, &stats).err();
    ScenarioResult {
        scenario,
        seed,
        passed: failure_reason.is_none(),
        failure_reason,
        report,
    }
}

fn expect(condition: bool, reason: String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason)
    }
}

fn expect_end(report: &RunReport, end: RunEnd) -> Result<(), String> {
    expect(
        report.end == Some(end) && report.error.is_none() && !report.truncated,
        format!(
            "expected {end}, got end={:?} error={:?} truncated={}",
            report.end, report.error, report.truncated
        ),
    )
}

fn evaluate(scenario: ScenarioId, report: &RunReport, stats: &ServerStats) -> Result<(), String> {
    match scenario {
        ScenarioId::SteadyState => {
            expect_end(report, RunEnd::FinishedOk)?;
            expect(report.steps == 20, format!("expected 20 steps, got {}", report.steps))?;
            expect(
                report.entities_created.len() == 2
                    && !report.entities_created.iter().any(|id| id == "ego"),
                format!("ego must be adopted, not rebuilt: {:?}", report.entities_created),
            )?;
            expect(
                report.entities_destroyed.is_empty(),
                format!("nothing should despawn: {:?}", report.entities_destroyed),
            )?;
            expect(
                report.live_entities == ["car-0", "car-1", "ego"],
                format!("wrong final entity set: {:?}", report.live_entities),
            )?;
            expect(
                stats.declared == vec!["ego".to_string()],
                format!("handshake should declare ego: {:?}", stats.declared),
            )?;
            expect(
                stats.announced_kinds == vec!["bicycle".to_string(), "car".to_string()],
                format!("wrong announced kinds: {:?}", stats.announced_kinds),
            )
        }
        ScenarioId::Churn => {
            expect_end(report, RunEnd::FinishedOk)?;
            expect(
                report.entities_created.len() == 5,
                format!("expected 5 creations, got {:?}", report.entities_created),
            )?;
            expect(
                report.entities_destroyed.contains(&"brief".to_string())
                    && report.entities_destroyed.contains(&"late-0".to_string()),
                format!("expected brief and late-0 destroyed: {:?}", report.entities_destroyed),
            )?;
            expect(
                report.live_entities == ["car-0", "car-1", "late-1"],
                format!("wrong final entity set: {:?}", report.live_entities),
            )
        }
        ScenarioId::LateJoin => {
            expect_end(report, RunEnd::FinishedOk)?;
            expect(
                report.entities_created == vec!["car-0".to_string(), "joiner".to_string()],
                format!("expected car-0 then joiner: {:?}", report.entities_created),
            )?;
            expect(
                report.entities_destroyed.is_empty(),
                format!("nothing should despawn: {:?}", report.entities_destroyed),
            )
        }
        ScenarioId::Accident => {
            expect_end(report, RunEnd::FinishedAccident)?;
            expect(report.steps == 12, format!("expected 12 steps, got {}", report.steps))
        }
        ScenarioId::TimeLimit => {
            expect_end(report, RunEnd::FinishedTimeLimit)?;
            expect(
                report.steps == 9,
                format!("limit of 1s at 100ms steps ends on tick 9, got {}", report.steps),
            )
        }
        ScenarioId::Stall => {
            expect(
                report.end.is_none() && !report.truncated,
                format!("stall must not finish cooperatively: {:?}", report.end),
            )?;
            expect(
                report
                    .error
                    .as_deref()
                    .map_or(false, |e| e.contains("timed out")),
                format!("expected a step timeout, got {:?}", report.error),
            )?;
            expect(report.steps == 5, format!("expected 5 steps, got {}", report.steps))?;
            expect(
                stats.steps_served == 5,
                format!("server should have served 5 steps, got {}", stats.steps_served),
            )
        }
        ScenarioId::UnknownKind => {
            expect(
                report
                    .error
                    .as_deref()
                    .map_or(false, |e| e.contains("hovercraft")),
                format!("expected an unknown-kind failure, got {:?}", report.error),
            )?;
            expect(
                report.entities_destroyed.is_empty(),
                format!("a failed pass must destroy nothing: {:?}", report.entities_destroyed),
            )?;
            expect(
                report.live_entities == ["car-0", "car-1"],
                format!("prior entities must survive: {:?}", report.live_entities),
            )
        }
        ScenarioId::LightControl => {
            expect_end(report, RunEnd::FinishedOk)?;
            expect(
                report.relay_replies == 4,
                format!("expected 4 relay replies, got {}", report.relay_replies),
            )?;
            expect(
                stats.generic_calls == 4,
                format!("server saw {} generic calls", stats.generic_calls),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_fromstr() {
        for scenario in ScenarioId::all() {
            let parsed: ScenarioId = scenario.name().parse().unwrap();
            assert_eq!(parsed, scenario);
        }
        assert!("no_such_scenario".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_descriptions_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for scenario in ScenarioId::all() {
            assert!(seen.insert(scenario.description()));
        }
    }

    #[test]
    fn test_steady_state_scenario() {
        let result = run_scenario(ScenarioId::SteadyState, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.report.steps, 20);
        assert_eq!(result.report.end, Some(RunEnd::FinishedOk));
    }

    #[test]
    fn test_churn_scenario() {
        let result = run_scenario(ScenarioId::Churn, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.report.entities_created.len(), 5);
        assert_eq!(result.report.live_entities.len(), 3);
    }

    #[test]
    fn test_late_join_scenario() {
        let result = run_scenario(ScenarioId::LateJoin, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.report.entities_created, vec!["car-0", "joiner"]);
    }

    #[test]
    fn test_accident_scenario() {
        let result = run_scenario(ScenarioId::Accident, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.report.end, Some(RunEnd::FinishedAccident));
    }

    #[test]
    fn test_time_limit_scenario() {
        let result = run_scenario(ScenarioId::TimeLimit, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.report.steps, 9);
        assert_eq!(result.report.end, Some(RunEnd::FinishedTimeLimit));
    }

    #[test]
    fn test_stall_scenario() {
        let result = run_scenario(ScenarioId::Stall, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.report.end.is_none());
        assert!(result.report.error.is_some());
    }

    #[test]
    fn test_unknown_kind_scenario() {
        let result = run_scenario(ScenarioId::UnknownKind, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.report.error.unwrap().contains("hovercraft"));
    }

    #[test]
    fn test_light_control_scenario() {
        let result = run_scenario(ScenarioId::LightControl, 42);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.report.relay_replies, 4);
    }

    #[test]
    fn test_scenarios_pass_on_other_seeds() {
        // Expectations depend on the scripted layout, not the seed.
        for scenario in ScenarioId::all() {
            let result = run_scenario(scenario, 1337);
            assert!(
                result.passed,
                "{} failed on seed 1337: {:?}",
                scenario,
                result.failure_reason
            );
        }
    }

    #[test]
    fn test_churn_deterministic() {
        // Same seed should give the same run, field for field
        let first = run_scenario(ScenarioId::Churn, 7);
        let second = run_scenario(ScenarioId::Churn, 7);

        assert_eq!(first.report, second.report);
    }
}
