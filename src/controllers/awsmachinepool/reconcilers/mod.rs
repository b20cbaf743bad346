pub(crate) mod fleet;
pub(crate) mod launch_template;
pub(crate) mod machines;
pub(crate) mod tags;
