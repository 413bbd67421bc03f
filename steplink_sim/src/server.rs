//! Mock authoritative simulator.
//!
//! [`WorldServer`] answers the bridge protocol from the other side of a
//! [`Link`]: it adopts the handshake, advances a [`WorldModel`] on every step
//! request, and snapshots the active entities into each reply. A
//! [`ServerScript`] injects the faults and terminations scenarios need:
//! scripted `FINISHED_*` statuses, the error status, time-limit enforcement,
//! and going silent mid-run.

use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use steplink_core::messages::{self, Reply, Request, SimulationStatus};
use steplink_core::transport::{Link, LinkError};

use crate::world::WorldModel;

const POLL: Duration = Duration::from_millis(50);

/// Scenario knobs for the server side.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// `initial_timestamp` returned from the handshake.
    pub initial_offset: f64,
    /// Terminal status to return instead of completing the handshake.
    pub finish_on_init: Option<SimulationStatus>,
    /// Terminal status to return for the step request with this index
    /// (0-based over step requests).
    pub finish: Option<(u64, SimulationStatus)>,
    /// Stop replying from this step request on, while keeping the link open.
    pub stall_at_step: Option<u64>,
    /// Honor the `time_limit` announced in the handshake.
    pub enforce_time_limit: bool,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            initial_offset: 0.0,
            finish_on_init: None,
            finish: None,
            stall_at_step: None,
            enforce_time_limit: true,
        }
    }
}

/// What the server observed over one run, for assertions after the fact.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub run_id: Option<String>,
    /// Entity ids the client pre-declared in the handshake.
    pub declared: Vec<String>,
    /// Entity kinds the client announced it can represent.
    pub announced_kinds: Vec<String>,
    /// Step requests answered with a running snapshot.
    pub steps_served: u64,
    pub generic_calls: u64,
    pub world_calls: u64,
}

/// One protocol endpoint serving one client over one link.
pub struct WorldServer<L: Link> {
    link: L,
    world: WorldModel,
    script: ServerScript,
    stats: ServerStats,
    /// From the handshake; negative means unbounded.
    time_limit: f64,
    step_index: u64,
    stalled: bool,
}

impl<L: Link> WorldServer<L> {
    pub fn new(link: L, world: WorldModel, script: ServerScript) -> Self {
        Self {
            link,
            world,
            script,
            stats: ServerStats::default(),
            time_limit: -1.0,
            step_index: 0,
            stalled: false,
        }
    }

    /// Serves until a terminal reply is sent or the client hangs up.
    pub fn run(mut self) -> ServerStats {
        loop {
            match self.link.recv_timeout(POLL) {
                Ok(frame) => {
                    if self.stalled {
                        trace!("stalled, dropping request");
                        continue;
                    }
                    if !self.handle(&frame) {
                        break;
                    }
                }
                Err(LinkError::Timeout) => continue,
                Err(_) => break,
            }
        }
        self.stats
    }

    pub fn spawn(self) -> JoinHandle<ServerStats>
    where
        L: 'static,
    {
        std::thread::spawn(move || self.run())
    }

    fn handle(&mut self, frame: &[u8]) -> bool {
        let request = match messages::decode_request(frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "undecodable request, closing");
                return false;
            }
        };
        match request {
            Request::Init {
                run_id,
                run_configuration,
                entities,
                entity_kinds,
                ..
            } => {
                self.stats.run_id = Some(run_id.clone());
                self.stats.declared = entities.into_iter().map(|decl| decl.entity_id).collect();
                self.stats.announced_kinds = entity_kinds;
                self.time_limit = run_configuration.time_limit;
                info!(
                    run_id = %run_id,
                    declared = self.stats.declared.len(),
                    step_size = run_configuration.step_size,
                    "handshake adopted"
                );

                let status = self
                    .script
                    .finish_on_init
                    .unwrap_or(SimulationStatus::Running);
                let terminal = status != SimulationStatus::Running;
                self.reply(&Reply::InitCompleted {
                    simulation_status: status,
                    initial_timestamp: self.script.initial_offset,
                    entities: self.world.snapshot(),
                }) && !terminal
            }

            Request::Step { step_size, .. } => {
                let current = self.step_index;
                self.step_index += 1;

                if self.script.stall_at_step == Some(current) {
                    debug!(step = current, "going silent");
                    self.stalled = true;
                    return true;
                }

                self.world.step(step_size);
                trace!(
                    step = current,
                    time = self.world.time(),
                    active = self.world.active_count(),
                    "world advanced"
                );

                if let Some((at, status)) = self.script.finish {
                    if current == at {
                        info!(step = current, code = status.code(), "scripted termination");
                        self.reply(&Reply::Updated {
                            simulation_status: status,
                            entities: self.world.snapshot(),
                        });
                        return false;
                    }
                }
                if self.script.enforce_time_limit
                    && self.time_limit >= 0.0
                    && self.world.time() >= self.time_limit
                {
                    info!(time = self.world.time(), "time limit reached");
                    self.reply(&Reply::Updated {
                        simulation_status: SimulationStatus::FinishedTimeLimit,
                        entities: self.world.snapshot(),
                    });
                    return false;
                }

                self.stats.steps_served += 1;
                self.reply(&Reply::Updated {
                    simulation_status: SimulationStatus::Running,
                    entities: self.world.snapshot(),
                })
            }

            Request::Generic { user_defined, .. } => {
                self.stats.generic_calls += 1;
                // Traffic-light style exchange for scenarios; anything else
                // echoes.
                let reply = match user_defined.get("light_next_state") {
                    Some(state) => serde_json::json!({ "light_curr_state": state.clone() }),
                    None => user_defined,
                };
                self.reply(&Reply::Generic {
                    simulation_status: SimulationStatus::Running,
                    user_defined: reply,
                })
            }

            Request::WorldGeneric { user_defined, .. } => {
                self.stats.world_calls += 1;
                self.reply(&Reply::WorldGeneric {
                    simulation_status: SimulationStatus::Running,
                    user_defined,
                })
            }
        }
    }

    fn reply(&mut self, reply: &Reply) -> bool {
        let frame = match messages::encode_reply(reply) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "reply encoding failed, closing");
                return false;
            }
        };
        match self.link.send(&frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "client gone, closing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldEntity;
    use nalgebra::Vector3;
    use steplink_core::messages::{RunConfiguration, EntityDecl};
    use steplink_core::transport::MemoryLink;
    use serde_json::json;

    fn init_request(time_limit: f64) -> Request {
        Request::Init {
            timestamp: 0.0,
            run_id: "test-run".to_string(),
            run_configuration: RunConfiguration {
                seed: 1,
                step_size: 0.1,
                time_limit,
            },
            entities: vec![EntityDecl {
                entity_id: "ego".to_string(),
                entity_kind: "car".to_string(),
                configuration: serde_json::Value::Null,
            }],
            user_defined: serde_json::Value::Null,
            entity_kinds: vec!["car".to_string()],
        }
    }

    fn exchange(link: &mut MemoryLink, request: &Request) -> Reply {
        link.send(&messages::encode_request(request).unwrap())
            .unwrap();
        let frame = link.recv_timeout(Duration::from_secs(2)).unwrap();
        messages::decode_reply(&frame).unwrap()
    }

    fn step_request(timestamp: f64) -> Request {
        Request::Step {
            timestamp,
            step_size: 0.1,
        }
    }

    #[test]
    fn test_handshake_and_step_snapshots() {
        let (mut client, server_link) = MemoryLink::pair();
        let mut world = WorldModel::new(3);
        world.insert(WorldEntity::cruising(
            "v1",
            "car",
            Vector3::zeros(),
            Vector3::new(5.0, 0.0, 0.0),
        ));
        let script = ServerScript {
            initial_offset: 0.25,
            ..ServerScript::default()
        };
        let server = WorldServer::new(server_link, world, script).spawn();

        match exchange(&mut client, &init_request(-1.0)) {
            Reply::InitCompleted {
                simulation_status,
                initial_timestamp,
                entities,
            } => {
                assert_eq!(simulation_status, SimulationStatus::Running);
                assert_eq!(initial_timestamp, 0.25);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, "v1");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        match exchange(&mut client, &step_request(0.25)) {
            Reply::Updated {
                simulation_status,
                entities,
            } => {
                assert_eq!(simulation_status, SimulationStatus::Running);
                assert!((entities[0].position[0] - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected reply {other:?}"),
        }

        drop(client);
        let stats = server.join().unwrap();
        assert_eq!(stats.run_id.as_deref(), Some("test-run"));
        assert_eq!(stats.declared, vec!["ego"]);
        assert_eq!(stats.announced_kinds, vec!["car"]);
        assert_eq!(stats.steps_served, 1);
    }

    #[test]
    fn test_time_limit_enforced_from_handshake() {
        let (mut client, server_link) = MemoryLink::pair();
        let server = WorldServer::new(
            server_link,
            WorldModel::new(3),
            ServerScript::default(),
        )
        .spawn();

        exchange(&mut client, &init_request(0.3));
        let mut terminal = None;
        for tick in 0..10 {
            match exchange(&mut client, &step_request(tick as f64 * 0.1)) {
                Reply::Updated {
                    simulation_status: SimulationStatus::Running,
                    ..
                } => continue,
                Reply::Updated {
                    simulation_status, ..
                } => {
                    terminal = Some((tick, simulation_status));
                    break;
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        // 3 steps of 0.1s reach the 0.3s limit.
        assert_eq!(terminal, Some((2, SimulationStatus::FinishedTimeLimit)));
        let stats = server.join().unwrap();
        assert_eq!(stats.steps_served, 2);
    }

    #[test]
    fn test_time_limit_lands_on_exact_tick() {
        let (mut client, server_link) = MemoryLink::pair();
        let server = WorldServer::new(
            server_link,
            WorldModel::new(3),
            ServerScript::default(),
        )
        .spawn();

        exchange(&mut client, &init_request(1.0));
        let mut terminal = None;
        for tick in 0..20 {
            match exchange(&mut client, &step_request(tick as f64 * 0.1)) {
                Reply::Updated {
                    simulation_status: SimulationStatus::Running,
                    ..
                } => continue,
                Reply::Updated {
                    simulation_status, ..
                } => {
                    terminal = Some((tick, simulation_status));
                    break;
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        // Ten steps of 0.1s land exactly on the 1s limit.
        assert_eq!(terminal, Some((9, SimulationStatus::FinishedTimeLimit)));
        let stats = server.join().unwrap();
        assert_eq!(stats.steps_served, 9);
    }

    #[test]
    fn test_light_command_transform_and_echo() {
        let (mut client, server_link) = MemoryLink::pair();
        let server = WorldServer::new(
            server_link,
            WorldModel::new(3),
            ServerScript::default(),
        )
        .spawn();
        exchange(&mut client, &init_request(-1.0));

        let reply = exchange(
            &mut client,
            &Request::Generic {
                timestamp: 0.0,
                user_defined: json!({"light_next_state": "red"}),
            },
        );
        match reply {
            Reply::Generic { user_defined, .. } => {
                assert_eq!(user_defined, json!({"light_curr_state": "red"}));
            }
            other => panic!("unexpected reply {other:?}"),
        }

        let reply = exchange(
            &mut client,
            &Request::WorldGeneric {
                timestamp: 0.0,
                user_defined: json!({"fog": 0.4}),
            },
        );
        match reply {
            Reply::WorldGeneric { user_defined, .. } => {
                assert_eq!(user_defined, json!({"fog": 0.4}));
            }
            other => panic!("unexpected reply {other:?}"),
        }

        drop(client);
        let stats = server.join().unwrap();
        assert_eq!(stats.generic_calls, 1);
        assert_eq!(stats.world_calls, 1);
    }

    #[test]
    fn test_stall_leaves_client_unanswered() {
        let (mut client, server_link) = MemoryLink::pair();
        let script = ServerScript {
            stall_at_step: Some(0),
            ..ServerScript::default()
        };
        let server = WorldServer::new(server_link, WorldModel::new(3), script).spawn();
        exchange(&mut client, &init_request(-1.0));

        client
            .send(&messages::encode_request(&step_request(0.0)).unwrap())
            .unwrap();
        assert!(matches!(
            client.recv_timeout(Duration::from_millis(120)),
            Err(LinkError::Timeout)
        ));

        drop(client);
        let stats = server.join().unwrap();
        assert_eq!(stats.steps_served, 0);
    }
}
