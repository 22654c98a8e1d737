use crate::error::FlowResult;
use crate::unit::{InitContext, RunContext, Unit};

/// Pass-through unit. Used as the start node of every graph and as the
/// re-entry point of a loop: link the tail of the loop body to it with a
/// repeat link and the body runs again next pass.
#[derive(Debug, Clone)]
pub struct Repeater {
    name: String,
}

impl Repeater {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Unit for Repeater {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> FlowResult<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> FlowResult<()> {
        Ok(())
    }
}
