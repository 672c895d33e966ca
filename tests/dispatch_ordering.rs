use std::thread;

use bevy_ecs::entity::Entity;
use bevy_ecs::world::World;
use kestrel_gameobject::api::entity_to_bits;
use kestrel_gameobject::config::{DispatchConfig, VmConfig};
use kestrel_gameobject::{
    EntryPoint, InputAction, PassReport, RuntimeConfig, ScriptContext, ScriptHandle, ScriptMessage, ScriptWorld,
    UpdateContext,
};
use serde_json::json;

const TALLY: &str = r#"
    fn init(obj) { this.updates = 0; this.inputs = 0; }
    fn update(obj, dt) { this.updates += 1; }
    fn on_input(obj, action_id, action) { this.inputs += 1; false }
"#;

struct Sim {
    entities: World,
    scripts: ScriptContext,
    world: ScriptWorld,
}

impl Sim {
    fn with_config(config: &RuntimeConfig) -> Self {
        Self { entities: World::new(), scripts: ScriptContext::new(config), world: ScriptWorld::new() }
    }

    fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    fn script(&mut self, filename: &str, source: &str) -> ScriptHandle {
        match self.scripts.find_script(filename) {
            Some(handle) => handle,
            None => self.scripts.load_script(source.as_bytes(), filename).expect("load script"),
        }
    }

    fn spawn_on(&mut self, owner: Entity, filename: &str, source: &str) -> Entity {
        let script = self.script(filename, source);
        self.world.create_instance(&mut self.scripts, script, owner).expect("create instance");
        owner
    }

    fn spawn(&mut self, filename: &str, source: &str) -> Entity {
        let owner = self.entities.spawn_empty().id();
        self.spawn_on(owner, filename, source)
    }

    fn update(&mut self) -> PassReport {
        let mut ctx = UpdateContext::new(0.016, &mut self.entities);
        self.world.update(&mut self.scripts, &mut ctx)
    }

    fn input(&mut self, action: InputAction) -> bool {
        self.world.dispatch_input(&mut self.scripts, &mut self.entities, &action)
    }

    fn read(&self, owner: Entity, key: &str) -> Option<i64> {
        self.world.state(&self.scripts, owner)?.get(key)?.as_i64()
    }

    fn order(&self) -> Vec<Entity> {
        self.world.iter().map(|(_, instance)| instance.instance()).collect()
    }

    fn teardown(self) -> u64 {
        let Sim { mut scripts, world, .. } = self;
        world.destroy(&mut scripts);
        scripts.shutdown().live()
    }
}

#[test]
fn update_visits_in_insertion_order() {
    let mut sim = Sim::new();
    let source = r#"
        fn update(obj, dt) { obj.log(`${obj.id()}`); }
    "#;
    let owners: Vec<Entity> = (0..4).map(|_| sim.spawn("logger.rhai", source)).collect();
    sim.update();

    let logged: Vec<String> = sim.scripts.take_logs().into_iter().map(|log| log.message).collect();
    let expected: Vec<String> = owners.iter().map(|owner| entity_to_bits(*owner).to_string()).collect();
    assert_eq!(logged, expected);
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn created_mid_pass_joins_next_pass() {
    let mut sim = Sim::new();
    sim.script("tally.rhai", TALLY);
    let spawner = sim.spawn(
        "spawner.rhai",
        r#"
            fn init(obj) { this.done = false; }
            fn update(obj, dt) {
                if !this.done { obj.create("tally.rhai"); this.done = true; }
            }
        "#,
    );
    let report = sim.update();
    assert_eq!((report.visited, report.created), (1, 1));

    let order = sim.order();
    assert_eq!(order.len(), 2);
    assert_eq!(order[0], spawner);
    let spawned = order[1];
    assert_eq!(sim.read(spawned, "updates"), None, "new instance must not run in the pass that created it");

    sim.update();
    assert_eq!(sim.read(spawned, "updates"), Some(1));
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn self_destroy_mid_pass_does_not_skip_the_next_instance() {
    let mut sim = Sim::new();
    let first = sim.spawn("tally.rhai", TALLY);
    let doomed = sim.spawn("doomed.rhai", "fn update(obj, dt) { obj.destroy_self(); }");
    let after = sim.spawn("tally2.rhai", TALLY);

    let report = sim.update();
    assert_eq!(report.visited, 3);
    assert_eq!(report.destroyed, 1);
    assert!(sim.world.handle_of(doomed).is_none());
    assert_eq!(sim.read(first, "updates"), Some(1));
    assert_eq!(sim.read(after, "updates"), Some(1));
    assert_eq!(sim.order(), vec![first, after]);

    sim.update();
    assert_eq!(sim.read(after, "updates"), Some(2));
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn input_stops_at_first_consumer() {
    let mut sim = Sim::new();
    let a = sim.spawn("tally.rhai", TALLY);
    let b = sim.spawn(
        "jumper.rhai",
        r#"
            fn init(obj) { this.jumps = 0; }
            fn on_input(obj, action_id, action) {
                if action_id != "jump" { return false; }
                this.jumps += 1;
                true
            }
        "#,
    );
    let c = sim.spawn("tally2.rhai", TALLY);
    sim.update();

    assert!(sim.input(InputAction::pressed("jump")));
    assert!(!sim.input(InputAction::pressed("fire")));
    assert_eq!(sim.read(a, "inputs"), Some(2));
    assert_eq!(sim.read(b, "jumps"), Some(1));
    assert_eq!(sim.read(c, "inputs"), Some(1), "only the unconsumed action reaches c");
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn instance_removed_during_input_is_skipped() {
    let mut sim = Sim::new();
    let victim = sim.entities.spawn_empty().id();
    let guard_source =
        format!("fn on_input(obj, action_id, action) {{ obj.destroy({}); false }}", entity_to_bits(victim));
    sim.spawn("guard.rhai", &guard_source);
    sim.spawn_on(victim, "tally.rhai", TALLY);
    let witness = sim.spawn("tally2.rhai", TALLY);
    sim.update();

    assert!(!sim.input(InputAction::pressed("any")));
    assert!(sim.world.handle_of(victim).is_none());
    assert_eq!(sim.read(witness, "inputs"), Some(1));
    assert!(sim.world.take_failures().is_empty());
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn faults_stay_contained_to_their_instance() {
    let config = RuntimeConfig { vm: VmConfig { max_operations: 5_000, ..VmConfig::default() }, ..Default::default() };
    let mut sim = Sim::with_config(&config);
    let before = sim.spawn("tally.rhai", TALLY);
    let thrower = sim.spawn("thrower.rhai", r#"fn update(obj, dt) { throw "bad frame"; }"#);
    let spinner = sim.spawn("spinner.rhai", "fn update(obj, dt) { let i = 0; loop { i += 1; } }");
    let crasher = sim.spawn("crasher.rhai", "fn update(obj, dt) { this.value = undefined_fn(); }");
    let after = sim.spawn("tally2.rhai", TALLY);

    for _ in 0..3 {
        let report = sim.update();
        assert_eq!(report.failed, 3);
    }
    assert_eq!(sim.read(before, "updates"), Some(3));
    assert_eq!(sim.read(after, "updates"), Some(3));

    let failures = sim.world.take_failures();
    assert_eq!(failures.len(), 9);
    let culprits: Vec<Entity> = failures.iter().take(3).map(|failure| failure.instance).collect();
    assert_eq!(culprits, vec![thrower, spinner, crasher]);
    assert!(failures.iter().all(|failure| failure.entry == EntryPoint::Update));
    assert_eq!(failures[1].filename, "spinner.rhai");
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn captured_logs_are_bounded_by_config() {
    let config = RuntimeConfig {
        dispatch: DispatchConfig { log_capacity: 4, ..DispatchConfig::default() },
        ..Default::default()
    };
    let mut sim = Sim::with_config(&config);
    sim.spawn(
        "chatty.rhai",
        r#"
            fn init(obj) { this.frame = 0; }
            fn update(obj, dt) { this.frame += 1; obj.log(`frame ${this.frame}`); }
        "#,
    );
    for _ in 0..10 {
        sim.update();
    }

    let logged: Vec<String> = sim.scripts.take_logs().into_iter().map(|log| log.message).collect();
    assert_eq!(logged, vec!["frame 7", "frame 8", "frame 9", "frame 10"]);
    assert_eq!(sim.scripts.vm().commands().borrow().dropped_logs(), 6);
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn message_sender_reaches_the_handler() {
    let mut sim = Sim::new();
    let sender = sim.spawn("tally.rhai", TALLY);
    let receiver = sim.spawn(
        "echo.rhai",
        "fn on_message(obj, id, message, sender) { this.from = sender; this.id = id; }",
    );
    let message = ScriptMessage::new("hello", json!({})).from_sender(sender);
    sim.world
        .dispatch_message(&mut sim.scripts, &mut sim.entities, receiver, &message)
        .expect("route");
    assert_eq!(sim.read(receiver, "from"), Some(entity_to_bits(sender)));
    assert_eq!(
        sim.world.state(&sim.scripts, receiver).and_then(|state| state.get("id").cloned()),
        Some(json!("hello"))
    );
    assert_eq!(sim.teardown(), 0);
}

#[test]
fn independent_worlds_run_on_separate_threads() {
    let workers: Vec<_> = (1..=2)
        .map(|step| {
            thread::spawn(move || {
                let mut sim = Sim::new();
                let source =
                    format!("fn init(obj) {{ this.total = 0; }} fn update(obj, dt) {{ this.total += {step}; }}");
                let owners: Vec<Entity> = (0..3).map(|_| sim.spawn("adder.rhai", &source)).collect();
                for _ in 0..10 {
                    sim.update();
                }
                let totals: Vec<Option<i64>> = owners.iter().map(|owner| sim.read(*owner, "total")).collect();
                (totals, sim.teardown())
            })
        })
        .collect();

    for (index, worker) in workers.into_iter().enumerate() {
        let (totals, live) = worker.join().expect("worker thread");
        let expected = 10 * (index as i64 + 1);
        assert_eq!(totals, vec![Some(expected); 3]);
        assert_eq!(live, 0);
    }
}
