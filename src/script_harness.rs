use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bevy_ecs::world::World;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::context::ScriptContext;
use crate::dispatch::{PassReport, UpdateContext};
use crate::error::ScriptError;
use crate::events::ScriptMessage;
use crate::input::InputAction;
use crate::instance::{ScriptFailure, ScriptResult};
use crate::world::ScriptWorld;
use crate::Instance;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    #[serde(default = "default_dt")]
    pub dt: f32,
    pub scripts: Vec<FixtureScript>,
    pub instances: Vec<FixtureInstance>,
    pub steps: Vec<FixtureStep>,
    /// Directory script paths are resolved against. Set by [`load_fixture`].
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureScript {
    /// Filename the script is registered under; `create()` calls resolve against it.
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureInstance {
    pub name: String,
    pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureStep {
    Update {
        #[serde(default)]
        dt: Option<f32>,
        #[serde(default = "default_count")]
        count: usize,
    },
    Message {
        target: String,
        id: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        sender: Option<String>,
    },
    Input(InputAction),
    Reload {
        script: String,
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub dt: f32,
    pub results: Vec<StepResult>,
    pub final_instances: Vec<InstanceSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub kind: String,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PassReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureSummary {
    pub instance: String,
    pub entry: String,
    pub filename: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSummary {
    pub name: String,
    pub script: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    run_fixture_with_config(fixture, &RuntimeConfig::default())
}

pub fn run_fixture_with_config(fixture: &HarnessFixture, config: &RuntimeConfig) -> Result<HarnessOutput> {
    let mut run = HarnessRun::new(config);
    for script in &fixture.scripts {
        let source = read_script(fixture, &script.path)?;
        run.scripts
            .load_script(&source, &script.name)
            .with_context(|| format!("loading script '{}'", script.name))?;
    }
    for instance in &fixture.instances {
        let handle = run
            .scripts
            .find_script(&instance.script)
            .ok_or_else(|| anyhow!("instance '{}' uses unknown script '{}'", instance.name, instance.script))?;
        let owner = run.entities.spawn_empty().id();
        run.world
            .create_instance(&mut run.scripts, handle, owner)
            .with_context(|| format!("creating instance '{}'", instance.name))?;
        run.label(owner, instance.name.clone());
    }

    let mut results = Vec::with_capacity(fixture.steps.len());
    for (step, planned) in fixture.steps.iter().enumerate() {
        let result = run.step(fixture, step, planned).with_context(|| format!("running step {step}"))?;
        results.push(result);
    }

    let final_instances = run.summaries();
    run.finish();
    Ok(HarnessOutput { dt: fixture.dt, results, final_instances })
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening fixture '{}'", path.display()))?;
    let mut fixture: HarnessFixture = serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?;
    fixture.base_dir = path.parent().map(Path::to_path_buf);
    Ok(fixture)
}

struct HarnessRun {
    entities: World,
    scripts: ScriptContext,
    world: ScriptWorld,
    labels: HashMap<Instance, String>,
    by_name: HashMap<String, Instance>,
    spawned: usize,
}

impl HarnessRun {
    fn new(config: &RuntimeConfig) -> Self {
        Self {
            entities: World::new(),
            scripts: ScriptContext::new(config),
            world: ScriptWorld::new(),
            labels: HashMap::new(),
            by_name: HashMap::new(),
            spawned: 0,
        }
    }

    fn label(&mut self, instance: Instance, name: String) {
        self.by_name.insert(name.clone(), instance);
        self.labels.insert(instance, name);
    }

    fn lookup(&self, name: &str) -> Result<Instance> {
        self.by_name.get(name).copied().ok_or_else(|| anyhow!("unknown instance '{name}'"))
    }

    fn step(&mut self, fixture: &HarnessFixture, step: usize, planned: &FixtureStep) -> Result<StepResult> {
        let mut result = StepResult {
            step,
            kind: String::new(),
            logs: Vec::new(),
            failures: Vec::new(),
            report: None,
            outcome: None,
            consumed: None,
        };
        match planned {
            FixtureStep::Update { dt, count } => {
                result.kind = "update".to_string();
                let mut total = PassReport::default();
                for _ in 0..*count {
                    let mut ctx = UpdateContext::new(dt.unwrap_or(fixture.dt), &mut self.entities);
                    let report = self.world.update(&mut self.scripts, &mut ctx);
                    total.visited += report.visited;
                    total.initialized += report.initialized;
                    total.failed += report.failed;
                    total.created += report.created;
                    total.destroyed += report.destroyed;
                    self.label_spawned();
                }
                result.report = Some(total);
            }
            FixtureStep::Message { target, id, payload, sender } => {
                result.kind = "message".to_string();
                let target = self.lookup(target)?;
                let sender = sender.as_deref().map(|name| self.lookup(name)).transpose()?;
                let mut message = ScriptMessage::new(id.clone(), payload.clone());
                message.sender = sender;
                let outcome =
                    self.world.dispatch_message(&mut self.scripts, &mut self.entities, target, &message);
                result.outcome = Some(
                    match outcome {
                        Ok(ScriptResult::Ok) => "ok",
                        Ok(ScriptResult::NoFunction) => "no_function",
                        Ok(ScriptResult::Failed(_)) => "failed",
                        Err(ScriptError::Routing { .. }) => "routing_error",
                        Err(err) => return Err(err.into()),
                    }
                    .to_string(),
                );
                self.label_spawned();
            }
            FixtureStep::Input(action) => {
                result.kind = "input".to_string();
                let consumed = self.world.dispatch_input(&mut self.scripts, &mut self.entities, action);
                result.consumed = Some(consumed);
                self.label_spawned();
            }
            FixtureStep::Reload { script, path } => {
                result.kind = "reload".to_string();
                let source = read_script(fixture, path)?;
                let outcome = match self.scripts.source_changed(script, &source) {
                    Ok(true) => "reloaded",
                    Ok(false) => "not_loaded",
                    Err(err) if err.is_compile() => "rejected",
                    Err(err) => return Err(err.into()),
                };
                result.outcome = Some(outcome.to_string());
            }
        }
        result.logs = self
            .scripts
            .take_logs()
            .into_iter()
            .map(|log| format!("{}: {}", self.name_of(log.instance), log.message))
            .collect();
        result.failures = self.world.take_failures().iter().map(|failure| self.summarize_failure(failure)).collect();
        Ok(result)
    }

    /// Names instances created by scripts in the order they joined the world.
    fn label_spawned(&mut self) {
        let unnamed: Vec<Instance> = self
            .world
            .iter()
            .map(|(_, instance)| instance.instance())
            .filter(|instance| !self.labels.contains_key(instance))
            .collect();
        for instance in unnamed {
            let name = format!("spawned{}", self.spawned);
            self.spawned += 1;
            self.label(instance, name);
        }
    }

    fn name_of(&self, instance: Instance) -> String {
        self.labels.get(&instance).cloned().unwrap_or_else(|| format!("{instance:?}"))
    }

    fn summarize_failure(&self, failure: &ScriptFailure) -> FailureSummary {
        FailureSummary {
            instance: self.name_of(failure.instance),
            entry: failure.entry.name().to_string(),
            filename: failure.filename.clone(),
            message: failure.message.clone(),
        }
    }

    fn summaries(&self) -> Vec<InstanceSummary> {
        self.world
            .iter()
            .map(|(_, instance)| InstanceSummary {
                name: self.name_of(instance.instance()),
                script: self
                    .scripts
                    .script(instance.script())
                    .map(|script| script.filename().to_string())
                    .unwrap_or_default(),
                phase: instance.phase().as_str().to_string(),
                state: instance.state(&self.scripts),
            })
            .collect()
    }

    fn finish(self) {
        let HarnessRun { mut scripts, world, .. } = self;
        world.destroy(&mut scripts);
        scripts.shutdown();
    }
}

fn read_script(fixture: &HarnessFixture, path: &str) -> Result<Vec<u8>> {
    let resolved = match &fixture.base_dir {
        Some(base) => base.join(path),
        None => PathBuf::from(path),
    };
    fs::read(&resolved).with_context(|| format!("reading script '{}'", resolved.display()))
}

fn default_dt() -> f32 {
    1.0 / 60.0
}

fn default_count() -> usize {
    1
}
