//! A symmetric ±1 random walk, the model bundled with the command line.

use std::sync::Arc;

use anyhow::anyhow;
use ganglion::{
    dispatch::net::{
        model::{BoxError, Model, ModelResolver, TaskCodec},
        wire::ModelUpload,
    },
    Outcome, Task,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

pub const MODEL_ID: &str = "random-walk";

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[archive(check_bytes)]
pub struct WalkParams {
    pub steps: u32,
    pub goal: i64,
}

impl WalkParams {
    /// Walks from zero for at most `steps` steps, stopping early once the
    /// goal is hit. Returns the final position.
    pub fn walk(&self, seed: u64) -> Outcome<i64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut position = 0i64;
        for _ in 0..self.steps {
            position += if rng.gen_bool(0.5) { 1 } else { -1 };
            if position == self.goal {
                return Outcome::new(position, true);
            }
        }
        Outcome::new(position, false)
    }

    /// The upload workers resolve back into a [`WalkModel`].
    pub fn upload(&self) -> anyhow::Result<ModelUpload> {
        let bytes = rkyv::to_bytes::<_, 256>(self)
            .map_err(|e| anyhow!("could not archive walk parameters: {e}"))?;
        Ok(ModelUpload::new(MODEL_ID, bytes.to_vec()))
    }

    fn from_bytecode(bytecode: &[u8]) -> Result<Self, BoxError> {
        let mut aligned = AlignedVec::with_capacity(bytecode.len());
        aligned.extend_from_slice(bytecode);
        rkyv::from_bytes::<WalkParams>(&aligned)
            .map_err(|_| BoxError::from("invalid walk parameters"))
    }
}

/// One walk, run locally.
#[derive(Debug, Clone, Copy)]
pub struct Walk {
    pub params: WalkParams,
    pub seed: u64,
}

impl Task for Walk {
    type Output = i64;

    fn run(self) -> Outcome<i64> {
        self.params.walk(self.seed)
    }
}

/// One walk, run on a worker. Only the seed travels with each task.
pub struct WalkModel {
    params: WalkParams,
}

impl Model for WalkModel {
    fn run(&self, task: &[u8]) -> Result<Outcome<Vec<u8>>, BoxError> {
        let seed: [u8; 8] = task.try_into()?;
        let outcome = self.params.walk(u64::from_le_bytes(seed));
        Ok(Outcome::new(
            outcome.value.to_le_bytes().to_vec(),
            outcome.reached_goal,
        ))
    }
}

pub struct WalkResolver;

impl ModelResolver for WalkResolver {
    fn resolve(&self, model_id: &str, bytecode: &[u8]) -> Result<Arc<dyn Model>, BoxError> {
        if model_id != MODEL_ID {
            Err(format!("this worker only runs {MODEL_ID}, not {model_id}"))?
        }
        let model: Arc<dyn Model> = Arc::new(WalkModel {
            params: WalkParams::from_bytecode(bytecode)?,
        });
        Ok(model)
    }
}

pub struct WalkCodec;

impl TaskCodec<Walk> for WalkCodec {
    fn encode_task(&self, task: &Walk) -> Result<Vec<u8>, BoxError> {
        Ok(task.seed.to_le_bytes().to_vec())
    }

    fn decode_output(&self, payload: &[u8]) -> Result<i64, BoxError> {
        let position: [u8; 8] = payload.try_into()?;
        Ok(i64::from_le_bytes(position))
    }
}
