//! Quickstart: three heterogeneous clients running SCAFFOLD rounds

use ndarray::ArrayD;
use scaffold_fl::hooks::{TrainableModel, TrainingOutputs};
use scaffold_fl::registry::NDARRAY_FRAMEWORK;
use scaffold_fl::{
    GlobalStateSnapshot, HookChain, HookRegistry, ParameterVector, ScaffoldAggregator,
    ScaffoldConfig, ScaffoldError,
};

/// Least-squares client pulling a 2-d weight vector toward its own target.
struct Client {
    weights: Vec<ArrayD<f32>>,
    grads: Vec<Option<ArrayD<f32>>>,
    target: ArrayD<f32>,
    samples: usize,
}

impl TrainableModel for Client {
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
        0.05
    }

    fn num_samples(&self) -> usize {
        self.samples
    }
}

impl Client {
    fn train(
        &mut self,
        hooks: &mut HookChain,
        global: &GlobalStateSnapshot,
        steps: usize,
    ) -> Result<TrainingOutputs, ScaffoldError> {
        self.weights = global.model.clone().into_arrays();
        hooks.on_train_start(self, global)?;
        for _ in 0..steps {
            self.grads = vec![Some(&self.weights[0] - &self.target)];
            hooks.on_before_optimizer_step(self)?;
            let lr = self.learning_rate();
            if let Some(g) = &self.grads[0] {
                self.weights[0].scaled_add(-lr, g);
            }
            hooks.on_after_optimizer_step(self)?;
        }
        hooks.on_train_end(self)
    }
}

fn main() {
    env_logger::init();

    println!("SCAFFOLD-FL Quickstart Demo\n");

    let initial = ParameterVector::from_shaped(vec![(vec![2], vec![0.0, 0.0])]).unwrap();
    let config = ScaffoldConfig::new(1.0).with_total_clients(3);
    let mut server = ScaffoldAggregator::with_model(config, initial).unwrap();
    let registry = HookRegistry::with_defaults();

    let targets = [[1.0f32, 0.0], [0.0, 1.0], [-1.0, -1.0]];
    let mut clients: Vec<(Client, HookChain)> = targets
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let client = Client {
                weights: Vec::new(),
                grads: Vec::new(),
                target: ArrayD::from_shape_vec(vec![2], t.to_vec()).unwrap(),
                samples: 100 * (i + 1),
            };
            // One chain per client for its whole lifetime so c_i survives rounds
            let hooks = registry
                .resolve(ScaffoldAggregator::required_hooks(), NDARRAY_FRAMEWORK)
                .into_chain();
            (client, hooks)
        })
        .collect();

    println!("Running 5 rounds with {} clients...\n", clients.len());
    for round in 0..5 {
        let global = server.snapshot().unwrap();
        let mut updates = Vec::new();
        for (client, hooks) in clients.iter_mut() {
            match client.train(hooks, &global, 10) {
                Ok(outputs) => updates.extend(outputs.local_update),
                Err(e) => println!("   client dropped from round {}: {}", round, e),
            }
        }

        let x = server.aggregate(&updates).unwrap();
        println!("Round {}: x = {:?}", round, x[0].as_slice().unwrap());
    }

    let c = server.control_variate().unwrap();
    println!("\nGlobal control variate: {:?}", c[0].as_slice().unwrap());
    println!("Rounds audited: {}", server.audit_log().len());
}
