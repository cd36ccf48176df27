//! The daemon's method table: forwarding client calls to configured
//! machines and tracking the resulting jobs.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    config::{Config, MachineConfig},
    engine::{JsonRpc, MethodError, Reply},
    job::{Conclusion, Job, JobEvent, JobInfo},
    Address,
};

type Registration = fn(&Arc<Dispatcher>, &JsonRpc, &'static str);

/// Every method a client engine gets, by wire name.
const METHODS: &[(&str, Registration)] = &[
    ("hello", register_hello),
    ("ping", register_ping),
    ("machines", register_machines),
    ("call", register_call),
    ("jobs", register_jobs),
    ("cancel_job", register_cancel_job),
];

struct Machine {
    config: MachineConfig,
    engine: Option<Arc<JsonRpc>>,
}

struct ForwardedJob {
    machine: String,
    job: Job,
}

/// A machine as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineInfo {
    /// Machine id from the config.
    pub id: String,
    /// How the machine is reached.
    pub address: Address,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// True while the daemon holds a live connection to it.
    pub connected: bool,
}

/// A forwarded job as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardedJobInfo {
    /// Machine the job runs on.
    pub machine: String,
    /// Job snapshot; its id is the one `cancel_job` takes.
    pub job: JobInfo,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    machine: String,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CancelJobParams {
    id: u64,
}

/// Routes client requests to machines.
pub struct Dispatcher {
    machines: DashMap<String, Machine>,
    jobs: DashMap<u64, ForwardedJob>,
    next_job: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher with no machines.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            machines: DashMap::new(),
            jobs: DashMap::new(),
            next_job: AtomicU64::new(1),
        })
    }

    /// Add or replace a machine. `engine` is its client engine, already
    /// running, if it is connected.
    pub fn add_machine(&self, id: impl Into<String>, config: MachineConfig, engine: Option<Arc<JsonRpc>>) {
        self.machines.insert(id.into(), Machine { config, engine });
    }

    /// Connect every configured machine and start its read loop. A machine
    /// that can not be reached is logged and left disconnected.
    pub async fn connect_machines(&self, config: &Config) {
        for (id, machine) in &config.machines {
            let engine = match machine.address.connect().await {
                Ok(connection) => {
                    tracing::info!(machine = id.as_str(), address = %machine.address, "connected to machine");
                    let engine = JsonRpc::new(connection);
                    tokio::spawn(engine.clone().run());
                    Some(engine)
                }
                Err(error) => {
                    tracing::warn!(
                        machine = id.as_str(),
                        address = %machine.address,
                        error = format!("{:?}", error),
                        "failed to connect to machine"
                    );
                    None
                }
            };
            self.add_machine(id.clone(), machine.clone(), engine);
        }
    }

    /// Install the daemon methods on a client-facing engine.
    pub fn register(self: &Arc<Self>, engine: &JsonRpc) {
        for &(name, register) in METHODS {
            register(self, engine, name);
        }
    }

    /// Every known machine, sorted by id.
    pub fn machines(&self) -> Vec<MachineInfo> {
        let mut machines: Vec<MachineInfo> = self
            .machines
            .iter()
            .map(|entry| MachineInfo {
                id: entry.key().clone(),
                address: entry.config.address.clone(),
                description: entry.config.description.clone(),
                connected: entry.engine.as_ref().is_some_and(|engine| !engine.is_stopped()),
            })
            .collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        machines
    }

    /// Forward `method` to a machine.
    ///
    /// The returned job sends the request when started and concludes the
    /// way the machine's reply does. Canceling it abandons the request.
    pub fn call(self: &Arc<Self>, machine: &str, method: &str, params: Option<Value>) -> Result<Job, MethodError> {
        let engine = match self.machines.get(machine) {
            None => return Err(MethodError::invalid_params(format!("unknown machine {:?}", machine))),
            Some(entry) => entry.engine.clone(),
        };
        let Some(engine) = engine.filter(|engine| !engine.is_stopped()) else {
            return Err(MethodError::invalid_params(format!("machine {:?} is not connected", machine)));
        };

        let request = engine.request(method, params);
        let id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(id, format!("{}/{}", machine, method));
        self.jobs.insert(
            id,
            ForwardedJob {
                machine: machine.to_owned(),
                job: job.clone(),
            },
        );
        tracing::debug!(job = id, machine, method, "forwarding call");

        let dispatcher = self.clone();
        let forwarded = job.clone();
        tokio::spawn(async move {
            follow(&forwarded, &request).await;
            dispatcher.jobs.remove(&forwarded.id());
        });

        Ok(job)
    }

    /// Forwarded jobs that have not concluded yet, sorted by id.
    pub fn jobs(&self) -> Vec<ForwardedJobInfo> {
        let mut jobs: Vec<ForwardedJobInfo> = self
            .jobs
            .iter()
            .map(|entry| ForwardedJobInfo {
                machine: entry.machine.clone(),
                job: entry.job.info(),
            })
            .collect();
        jobs.sort_by_key(|info| info.job.id);
        jobs
    }

    /// Cancel a forwarded job. False if no such job is running.
    pub fn cancel_job(&self, id: u64) -> bool {
        let job = self.jobs.get(&id).map(|entry| entry.job.clone());
        job.is_some_and(|job| job.cancel())
    }

    /// Cancel every forwarded job and close every machine connection.
    pub async fn shutdown(&self) {
        let jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.job.clone()).collect();
        for job in jobs {
            job.cancel();
        }

        let engines: Vec<Arc<JsonRpc>> = self
            .machines
            .iter()
            .filter_map(|entry| entry.engine.clone())
            .collect();
        for engine in engines {
            engine.close().await;
        }
    }
}

/// Drive `request` on behalf of `job` until either concludes, passing the
/// request's heartbeats on to `job`.
async fn follow(job: &Job, request: &Job) {
    if !job.started().await || job.is_stopped() {
        request.cancel();
        return;
    }

    let mut events = request.subscribe();
    request.start();
    let conclusion = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(JobEvent::Heartbeat(progress)) => {
                    job.heartbeat(progress);
                }
                Ok(JobEvent::Stopped(conclusion)) => break conclusion,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break request.stopped().await,
            },
            conclusion = request.stopped() => break conclusion,
            _ = job.stopped() => {
                tracing::debug!(job = job.id(), "forwarded job stopped early; abandoning request");
                request.cancel();
                return;
            }
        }
    };

    match conclusion {
        Conclusion::Ended(result) => job.end(result),
        Conclusion::Failed(failure) => job.fail(failure),
        Conclusion::Canceled => job.cancel(),
    };
}

fn register_hello(_: &Arc<Dispatcher>, engine: &JsonRpc, name: &'static str) {
    engine.add_method(name, |()| async {
        Ok::<_, MethodError>(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }))
    });
}

fn register_ping(_: &Arc<Dispatcher>, engine: &JsonRpc, name: &'static str) {
    engine.add_method(name, |()| async { Ok::<_, MethodError>("pong") });
}

fn register_machines(dispatcher: &Arc<Dispatcher>, engine: &JsonRpc, name: &'static str) {
    let dispatcher = dispatcher.clone();
    engine.add_method(name, move |()| {
        let machines = dispatcher.machines();
        async move { Ok::<_, MethodError>(serde_json::to_value(machines)?) }
    });
}

fn register_call(dispatcher: &Arc<Dispatcher>, engine: &JsonRpc, name: &'static str) {
    let dispatcher = dispatcher.clone();
    engine.add_method(name, move |params: CallParams| {
        let called = dispatcher.call(&params.machine, &params.method, params.params);
        async move { called.map(Reply::Job) }
    });
}

fn register_jobs(dispatcher: &Arc<Dispatcher>, engine: &JsonRpc, name: &'static str) {
    let dispatcher = dispatcher.clone();
    engine.add_method(name, move |()| {
        let jobs = dispatcher.jobs();
        async move { Ok::<_, MethodError>(serde_json::to_value(jobs)?) }
    });
}

fn register_cancel_job(dispatcher: &Arc<Dispatcher>, engine: &JsonRpc, name: &'static str) {
    let dispatcher = dispatcher.clone();
    engine.add_method(name, move |params: CancelJobParams| {
        let canceled = dispatcher.cancel_job(params.id);
        async move { Ok::<_, MethodError>(canceled) }
    });
}
