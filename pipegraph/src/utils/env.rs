pub(crate) const XDG_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";
pub(crate) const PIPEGRAPH_CORE: &str = "PIPEGRAPH_CORE";
pub(crate) const PIPEGRAPH_DEBUG: &str = "PIPEGRAPH_DEBUG";

pub(crate) const DEFAULT_CORE_NAME: &str = "pipegraph-0";
