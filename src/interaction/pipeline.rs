//! The ordered stage pipeline every inbound message runs through.
//!
//! Stages run one after the other; the first one that returns [`Flow::Stop`] has
//! fully handled the message and ends the run. When every stage continues, the
//! caller falls back to the plain chat completion flow.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{
    Services,
    commands::{COMMANDS, CommandStage},
    context::EventContext,
    gating::{DedupStage, EmptyTextStage, MentionStage},
};

/// What a stage tells the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the message to the next stage.
    Continue,
    /// The message is fully handled; run nothing else.
    Stop,
}

/// What the runner tells its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The named stage stopped the pipeline.
    Handled { stage: &'static str },
    /// Every stage continued.
    Unhandled,
}

/// One unit of the pipeline.
///
/// A stage that returns [`Flow::Stop`] must already have sent everything the user
/// should see for that path.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable name, used in logs and in [`Outcome::Handled`].
    fn name(&self) -> &'static str;

    async fn evaluate(&self, event: &EventContext) -> Flow;
}

/// The fixed, ordered list of stages.
///
/// Holds no state besides the stages, so one instance serves every event.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Gating stages (dedup, mention, empty text) followed by one stage per command.
    pub fn standard(services: &Services) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(DedupStage::new(services.dedup.clone())),
            Box::new(MentionStage::new(services.chat.bot_user_id())),
            Box::new(EmptyTextStage),
        ];

        stages.extend(COMMANDS.iter().map(|spec| Box::new(CommandStage::new(spec, services.clone())) as Box<dyn Stage>));

        Self::new(stages)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    #[instrument(skip_all, fields(message_id = %event.message_id))]
    pub async fn run(&self, event: &EventContext) -> Outcome {
        for stage in &self.stages {
            if stage.evaluate(event).await == Flow::Stop {
                debug!("Stage `{}` handled the message.", stage.name());
                return Outcome::Handled { stage: stage.name() };
            }
        }

        Outcome::Unhandled
    }
}

// Tests.
