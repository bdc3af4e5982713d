//! Integration tests for SCAFFOLD-FL rounds

use ndarray::ArrayD;
use scaffold_fl::aggregators::{ScaffoldAggregator, ScaffoldConfig};
use scaffold_fl::error::ScaffoldError;
use scaffold_fl::hooks::{HookChain, ScaffoldCoordinator, TrainableModel, TrainingHook};
use scaffold_fl::params::ParameterVector;
use scaffold_fl::registry::{HookRegistry, HookRequirement, NDARRAY_FRAMEWORK};
use scaffold_fl::update::{GlobalStateSnapshot, LocalUpdate};

/// Scalar-per-parameter model trained with plain SGD on `0.5 * (w - target)^2`.
struct QuadraticClient {
    weights: Vec<ArrayD<f32>>,
    targets: Vec<f32>,
    grads: Vec<Option<ArrayD<f32>>>,
    lr: f32,
    samples: usize,
}

impl QuadraticClient {
    fn new(targets: &[f32], lr: f32, samples: usize) -> Self {
        Self {
            weights: Vec::new(),
            targets: targets.to_vec(),
            grads: Vec::new(),
            lr,
            samples,
        }
    }

    fn load(&mut self, global: &GlobalStateSnapshot) {
        self.weights = global.model.clone().into_arrays();
        self.grads = vec![None; self.weights.len()];
    }

    fn backward(&mut self) {
        self.grads = self
            .weights
            .iter()
            .zip(&self.targets)
            .map(|(w, &t)| Some(w.mapv(|v| v - t)))
            .collect();
    }

    fn optimizer_step(&mut self) {
        for (w, g) in self.weights.iter_mut().zip(&self.grads) {
            if let Some(g) = g {
                w.scaled_add(-self.lr, g);
            }
        }
    }

    /// One local run of `steps` SGD steps with the hooks attached.
    fn train(
        &mut self,
        hooks: &mut HookChain,
        global: &GlobalStateSnapshot,
        steps: usize,
    ) -> LocalUpdate {
        self.load(global);
        hooks.on_train_start(&*self, global).unwrap();
        for _ in 0..steps {
            self.backward();
            hooks.on_before_optimizer_step(&*self).unwrap();
            self.optimizer_step();
            hooks.on_after_optimizer_step(self).unwrap();
        }
        hooks.on_train_epoch_end(&*self).unwrap();
        hooks.on_train_end(&*self).unwrap().local_update.unwrap()
    }
}

impl TrainableModel for QuadraticClient {
    fn parameters(&self) -> &[ArrayD<f32>] {
        &self.weights
    }

    fn parameters_mut(&mut self) -> &mut [ArrayD<f32>] {
        &mut self.weights
    }

    fn gradient(&self, index: usize) -> Option<&ArrayD<f32>> {
        self.grads.get(index).and_then(|g| g.as_ref())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn num_samples(&self) -> usize {
        self.samples
    }
}

fn scalars(values: &[f32]) -> ParameterVector {
    ParameterVector::from_shaped(values.iter().map(|&v| (vec![1], vec![v])).collect()).unwrap()
}

fn values(v: &ParameterVector) -> Vec<f32> {
    v.iter().map(|a| a.sum()).collect()
}

fn assert_close(actual: &[f32], expected: &[f32], what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length");
    for (a, e) in actual.iter().zip(expected) {
        assert!(
            (a - e).abs() < 1e-4,
            "{what}: expected {expected:?}, got {actual:?}"
        );
    }
}

fn scaffold_chain() -> HookChain {
    HookRegistry::with_defaults()
        .resolve(ScaffoldAggregator::required_hooks(), NDARRAY_FRAMEWORK)
        .into_chain()
}

// --- Full rounds ---

#[test]
fn test_round_matches_sum_of_client_deltas() {
    let mut server =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(0.5), scalars(&[0.0, 0.0])).unwrap();
    let mut clients = vec![
        (QuadraticClient::new(&[1.0, -1.0], 0.1, 50), scaffold_chain()),
        (QuadraticClient::new(&[3.0, 2.0], 0.1, 150), scaffold_chain()),
    ];

    let global = server.snapshot().unwrap();
    let updates: Vec<LocalUpdate> = clients
        .iter_mut()
        .map(|(client, hooks)| client.train(hooks, &global, 5))
        .collect();

    let dy_sum: Vec<f32> = (0..2)
        .map(|i| updates.iter().map(|u| values(u.delta_y())[i]).sum())
        .collect();
    let dc_sum: Vec<f32> = (0..2)
        .map(|i| updates.iter().map(|u| values(u.delta_c())[i]).sum())
        .collect();

    let x = values(server.aggregate(&updates).unwrap());
    assert_close(&x, &[0.5 * dy_sum[0], 0.5 * dy_sum[1]], "global model");
    assert_close(&values(server.control_variate().unwrap()), &dc_sum, "global c");
    assert_eq!(updates[1].num_samples(), 150);
}

#[test]
fn test_client_control_variate_persists_across_rounds() {
    let mut server =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), scalars(&[0.0])).unwrap();
    let mut client = QuadraticClient::new(&[2.0], 0.1, 10);
    let mut coordinator = ScaffoldCoordinator::new();

    let mut c_i_history = Vec::new();
    for _ in 0..3 {
        let global = server.snapshot().unwrap();
        client.load(&global);
        coordinator.start_run(&client, &global.control_variate).unwrap();
        for _ in 0..4 {
            client.backward();
            coordinator.before_step(&client).unwrap();
            client.optimizer_step();
            coordinator.after_step(&mut client).unwrap();
        }
        let update = coordinator.finish_run(&client).unwrap();
        let c_i = values(coordinator.local_control_variate().unwrap());

        // delta_c_i is exactly the change in the persisted c_i
        let previous = c_i_history.last().cloned().unwrap_or(vec![0.0]);
        assert_close(
            &values(update.delta_c()),
            &[c_i[0] - previous[0]],
            "delta_c_i",
        );
        c_i_history.push(c_i);
        server.aggregate(&[update]).unwrap();
    }
    assert_eq!(server.round(), 3);
    assert_eq!(server.audit_log().len(), 3);
}

// --- Scripted scenario ---

#[test]
fn test_scripted_two_parameter_scenario() {
    // x = [1.0, 2.0], 3 steps, eta_l = 0.1, synthetic gradients g = [1.0, -2.0]
    let global = GlobalStateSnapshot {
        model: scalars(&[1.0, 2.0]),
        control_variate: scalars(&[0.0, 0.0]),
    };
    let mut client = QuadraticClient::new(&[0.0, 0.0], 0.1, 3);
    client.load(&global);
    let mut coordinator = ScaffoldCoordinator::new();
    coordinator.start_run(&client, &global.control_variate).unwrap();
    for _ in 0..3 {
        client.grads = vec![
            Some(ArrayD::from_elem(vec![1], 1.0)),
            Some(ArrayD::from_elem(vec![1], -2.0)),
        ];
        coordinator.before_step(&client).unwrap();
        client.optimizer_step();
        coordinator.after_step(&mut client).unwrap();
    }
    let update = coordinator.finish_run(&client).unwrap();

    // y = [1.0 - 0.3, 2.0 + 0.6] = [0.7, 2.6]
    assert_close(&values(update.delta_y()), &[-0.3, 0.6], "delta_y_i");
    // c_i_new = 0 - ([0.3, -0.6]) / 0.3 = [-1.0, 2.0]
    assert_close(&values(update.delta_c()), &[-1.0, 2.0], "delta_c_i");
    assert_close(
        &values(coordinator.local_control_variate().unwrap()),
        &[-1.0, 2.0],
        "persisted c_i",
    );
}

// --- Independent coordinators ---

#[test]
fn test_coordinators_share_nothing() {
    let x = scalars(&[1.0, 1.0]);
    let c = scalars(&[0.0, 0.0]);
    let mut a = ScaffoldCoordinator::with_control_variate(scalars(&[0.5, 0.5]));
    let mut b = ScaffoldCoordinator::with_control_variate(scalars(&[-2.0, 3.0]));

    // Identical observed trajectory: frozen parameters, final weights set by the host
    let run = |coordinator: &mut ScaffoldCoordinator| {
        let mut client = QuadraticClient::new(&[0.0, 0.0], 0.1, 1);
        client.weights = x.clone().into_arrays();
        client.grads = vec![None, None];
        coordinator.start_run(&client, &c).unwrap();
        for _ in 0..2 {
            coordinator.before_step(&client).unwrap();
            coordinator.after_step(&mut client).unwrap();
        }
        client.weights = scalars(&[0.8, 1.4]).into_arrays();
        coordinator.finish_run(&client).unwrap()
    };
    let update_a = run(&mut a);
    let update_b = run(&mut b);

    // delta_y_i depends only on x and y_i
    assert_eq!(update_a.delta_y(), update_b.delta_y());
    // delta_c_i = -(x - y_i) / (K * eta_l) for both, the persisted c_i keep their offset
    assert_close(&values(update_a.delta_c()), &[-1.0, 2.0], "delta_c_i a");
    assert_close(&values(update_b.delta_c()), &[-1.0, 2.0], "delta_c_i b");
    assert_close(&values(a.local_control_variate().unwrap()), &[-0.5, 2.5], "c_i a");
    assert_close(&values(b.local_control_variate().unwrap()), &[-3.0, 5.0], "c_i b");
}

#[test]
fn test_different_control_variates_change_corrected_trajectory() {
    let global = GlobalStateSnapshot {
        model: scalars(&[0.0]),
        control_variate: scalars(&[0.0]),
    };
    let mut a = ScaffoldCoordinator::with_control_variate(scalars(&[0.0]));
    let mut b = ScaffoldCoordinator::with_control_variate(scalars(&[1.0]));

    let mut updates = Vec::new();
    for coordinator in [&mut a, &mut b] {
        let mut client = QuadraticClient::new(&[1.0], 0.1, 1);
        client.load(&global);
        coordinator.start_run(&client, &global.control_variate).unwrap();
        for _ in 0..3 {
            client.backward();
            coordinator.before_step(&client).unwrap();
            client.optimizer_step();
            coordinator.after_step(&mut client).unwrap();
        }
        updates.push(coordinator.finish_run(&client).unwrap());
    }
    assert_ne!(updates[0].delta_y(), updates[1].delta_y());
    assert_ne!(updates[0].delta_c(), updates[1].delta_c());
}

// --- Partial participation ---

#[test]
fn test_two_of_four_clients_report() {
    let config = ScaffoldConfig::new(1.0).with_total_clients(4);
    let mut partial = ScaffoldAggregator::with_model(config, scalars(&[0.0, 0.0])).unwrap();
    let mut full =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), scalars(&[0.0, 0.0])).unwrap();

    let updates = vec![
        LocalUpdate::new(scalars(&[0.1, 0.2]), scalars(&[1.0, -2.0]), 10),
        LocalUpdate::new(scalars(&[0.3, 0.4]), scalars(&[3.0, 4.0]), 10),
    ];
    partial.aggregate(&updates).unwrap();
    full.aggregate(&updates).unwrap();

    assert_close(&values(full.control_variate().unwrap()), &[4.0, 2.0], "full c");
    assert_close(&values(partial.control_variate().unwrap()), &[2.0, 1.0], "half c");
    assert_eq!(partial.model().unwrap(), full.model().unwrap());
}

// --- Error paths ---

#[test]
fn test_empty_round_leaves_state_unchanged() {
    let mut server =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), scalars(&[1.0])).unwrap();
    let before = server.snapshot().unwrap();
    assert!(matches!(server.aggregate(&[]), Err(ScaffoldError::NoUpdates)));
    assert_eq!(server.snapshot().unwrap(), before);
}

#[test]
fn test_zero_step_client_excluded_from_round() {
    let mut server =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), scalars(&[0.0])).unwrap();
    let global = server.snapshot().unwrap();

    let mut idle = QuadraticClient::new(&[1.0], 0.1, 1);
    let mut idle_hooks = scaffold_chain();
    idle.load(&global);
    idle_hooks.on_train_start(&idle, &global).unwrap();
    assert_eq!(
        idle_hooks.on_train_end(&idle).unwrap_err(),
        ScaffoldError::ZeroLocalSteps
    );

    let mut busy = QuadraticClient::new(&[1.0], 0.1, 1);
    let update = busy.train(&mut scaffold_chain(), &global, 2);
    server.aggregate(&[update]).unwrap();
    assert_eq!(server.audit_log().last().unwrap().n_updates, 1);
}

#[test]
fn test_aborted_run_emits_nothing() {
    let global = GlobalStateSnapshot {
        model: scalars(&[0.0]),
        control_variate: scalars(&[0.0]),
    };
    let mut client = QuadraticClient::new(&[1.0], 0.1, 1);
    let mut hooks = scaffold_chain();
    client.load(&global);
    hooks.on_train_start(&client, &global).unwrap();
    client.backward();
    hooks.on_before_optimizer_step(&client).unwrap();
    hooks.abort();

    assert!(hooks.on_train_end(&client).is_err());
    // The chain is reusable after an abort
    let update = client.train(&mut hooks, &global, 1);
    assert_eq!(update.num_samples(), 1);
}

// --- Registry ---

#[test]
fn test_registry_conflict_and_missing() {
    let mut registry = HookRegistry::new();
    registry
        .register(HookRequirement::Scaffold, "custom", || {
            Box::new(ScaffoldCoordinator::new())
        })
        .unwrap();
    assert!(matches!(
        registry.register(HookRequirement::Scaffold, "custom", || {
            Box::new(ScaffoldCoordinator::new())
        }),
        Err(ScaffoldError::RegistrationConflict { .. })
    ));

    let requested = [HookRequirement::Scaffold, HookRequirement::GradientCapture];
    let resolution = registry.resolve(requested, "custom");
    assert!(resolution.hooks.len() < requested.len());
    assert_eq!(resolution.missing, vec![HookRequirement::GradientCapture]);
    assert_eq!(resolution.hooks[0].requirement(), HookRequirement::Scaffold);
}

#[test]
fn test_gradient_capture_alongside_scaffold() {
    let registry = HookRegistry::with_defaults();
    let mut hooks = registry
        .resolve(
            [HookRequirement::GradientCapture, HookRequirement::Scaffold],
            NDARRAY_FRAMEWORK,
        )
        .into_chain();
    let global = GlobalStateSnapshot {
        model: scalars(&[0.0, 0.0]),
        control_variate: scalars(&[0.0, 0.0]),
    };

    let mut client = QuadraticClient::new(&[1.0, 2.0], 0.5, 8);
    client.load(&global);
    hooks.on_train_start(&client, &global).unwrap();
    client.backward();
    hooks.on_before_optimizer_step(&client).unwrap();
    client.optimizer_step();
    hooks.on_after_optimizer_step(&mut client).unwrap();
    hooks.on_train_epoch_end(&client).unwrap();
    let outputs = hooks.on_train_end(&client).unwrap();

    let grads = outputs.gradients.expect("gradients captured");
    assert_eq!(grads[0].as_ref().unwrap().sum(), -1.0);
    assert_eq!(grads[1].as_ref().unwrap().sum(), -2.0);
    assert_close(
        &values(outputs.local_update.unwrap().delta_y()),
        &[0.5, 1.0],
        "delta_y_i",
    );
}

// --- Wire records ---

#[test]
fn test_update_survives_json_transport() {
    let mut server =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), scalars(&[0.0])).unwrap();
    let mut client = QuadraticClient::new(&[1.0], 0.1, 4);
    let update = client.train(&mut scaffold_chain(), &server.snapshot().unwrap(), 3);

    let wire = serde_json::to_string(&update).unwrap();
    let received: LocalUpdate = serde_json::from_str(&wire).unwrap();
    assert_eq!(received, update);

    server.aggregate(&[received]).unwrap();
    let snapshot_wire = serde_json::to_string(&server.snapshot().unwrap()).unwrap();
    let snapshot: GlobalStateSnapshot = serde_json::from_str(&snapshot_wire).unwrap();
    assert_eq!(&snapshot.model, server.model().unwrap());
}

#[test]
fn test_oversized_sample_counts_rejected_from_wire() {
    let mut server =
        ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), scalars(&[0.0])).unwrap();
    let mut wire =
        serde_json::to_value(LocalUpdate::new(scalars(&[0.5]), scalars(&[0.5]), 1)).unwrap();
    wire["num_samples"] = serde_json::Value::from(usize::MAX);
    let received: LocalUpdate = serde_json::from_value(wire).unwrap();
    assert_eq!(received.num_samples(), usize::MAX);

    let before = server.snapshot().unwrap();
    assert!(matches!(
        server.aggregate(&[received.clone(), received]),
        Err(ScaffoldError::SampleCountOverflow { n_updates: 2 })
    ));
    assert_eq!(server.snapshot().unwrap(), before);
    assert_eq!(server.round(), 0);
}
