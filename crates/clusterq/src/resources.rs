use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use nom::branch::alt;
use nom::bytes::complete::tag_no_case;
use nom::character::complete::space0;
use nom::combinator::{map, opt, value};
use nom::sequence::{terminated, tuple};
use serde::{Deserialize, Serialize};

use crate::common::error::configuration_error;
use crate::common::parser::{NomResult, consume_all, p_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryUnit {
    K,
    M,
    G,
    T,
}

impl MemoryUnit {
    fn kilobytes(self) -> u64 {
        match self {
            MemoryUnit::K => 1,
            MemoryUnit::M => 1024,
            MemoryUnit::G => 1024 * 1024,
            MemoryUnit::T => 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub value: u64,
    pub unit: MemoryUnit,
}

impl Memory {
    pub fn new(value: u64, unit: MemoryUnit) -> Self {
        Self { value, unit }
    }

    /// Kilobytes are the smallest unit understood by all backends.
    /// Returns `None` if the amount does not fit into `u64` kilobytes.
    pub fn to_kilobytes(&self) -> Option<u64> {
        self.value.checked_mul(self.unit.kilobytes())
    }
}

fn p_memory_unit(input: &str) -> NomResult<MemoryUnit> {
    terminated(
        alt((
            value(MemoryUnit::K, tag_no_case("k")),
            value(MemoryUnit::M, tag_no_case("m")),
            value(MemoryUnit::G, tag_no_case("g")),
            value(MemoryUnit::T, tag_no_case("t")),
        )),
        opt(tag_no_case("b")),
    )(input)
}

fn p_memory(input: &str) -> NomResult<Memory> {
    map(
        tuple((p_u64, space0, p_memory_unit)),
        |(value, _, unit)| Memory { value, unit },
    )(input)
}

/// Parses memory amounts like `512k`, `10m`, `4GB` or `1 t`.
impl FromStr for Memory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let memory = consume_all(p_memory, s.trim())?;
        if memory.to_kilobytes().is_none() {
            anyhow::bail!("Memory amount `{s}` is too large");
        }
        Ok(memory)
    }
}

impl Display for Memory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit {
            MemoryUnit::K => "K",
            MemoryUnit::M => "M",
            MemoryUnit::G => "G",
            MemoryUnit::T => "T",
        };
        write!(f, "{}{unit}", self.value)
    }
}

/// Abstract resource request of a job.
/// Fields that are not set are not passed to the backend at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub queue: Option<String>,
    pub memory: Option<Memory>,
    pub cores: Option<u32>,
    pub nodes: Option<u32>,
    pub walltime: Option<Duration>,
}

/// Group of backend-native arguments that belong together, e.g. `["-l", "walltime=01:00:00"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterFragment(Vec<String>);

impl ParameterFragment {
    pub fn new<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Self(args.into_iter().map(|arg| arg.into()).collect())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

/// Backend-native rendering of a resource request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingParameters {
    fragments: Vec<ParameterFragment>,
}

impl ProcessingParameters {
    pub fn push(&mut self, fragment: ParameterFragment) {
        self.fragments.push(fragment);
    }

    pub fn fragments(&self) -> &[ParameterFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Flattens all fragments into a single argument list.
    pub fn to_args(&self) -> Vec<String> {
        self.fragments
            .iter()
            .flat_map(|fragment| fragment.args().iter().cloned())
            .collect()
    }
}

/// Backend-specific rules for rendering individual resource fields.
///
/// Returning `None` means that the backend has no use for the given field.
pub trait ResourceRenderer {
    fn render_queue(&self, queue: &str) -> Option<ParameterFragment>;

    fn render_memory(&self, kilobytes: u64) -> Option<ParameterFragment>;

    fn render_cores(&self, cores: u32) -> Option<ParameterFragment>;

    fn render_nodes(&self, nodes: u32) -> Option<ParameterFragment>;

    /// Backends which request cores per node in a single expression override this.
    fn render_nodes_and_cores(
        &self,
        nodes: Option<u32>,
        cores: Option<u32>,
    ) -> Vec<ParameterFragment> {
        nodes
            .and_then(|nodes| self.render_nodes(nodes))
            .into_iter()
            .chain(cores.and_then(|cores| self.render_cores(cores)))
            .collect()
    }

    /// Formats walltime in the syntax of the backend.
    fn format_walltime(&self, walltime: &Duration) -> String;

    fn render_walltime(&self, walltime: &str) -> Option<ParameterFragment>;
}

/// Renders every field of `resources` that is set.
///
/// Fails with a configuration error for amounts that cannot be represented by backends
/// (memory beyond `u64` kilobytes, more than `u32` cores in total).
pub fn translate_resources<R: ResourceRenderer + ?Sized>(
    resources: &ResourceSet,
    renderer: &R,
) -> crate::Result<ProcessingParameters> {
    let mut params = ProcessingParameters::default();
    if let Some(fragment) = resources
        .queue
        .as_deref()
        .and_then(|queue| renderer.render_queue(queue))
    {
        params.push(fragment);
    }
    if let Some(memory) = resources.memory {
        let Some(kilobytes) = memory.to_kilobytes() else {
            return configuration_error(format!("Memory request {memory} is too large"));
        };
        if let Some(fragment) = renderer.render_memory(kilobytes) {
            params.push(fragment);
        }
    }
    if let (Some(nodes), Some(cores)) = (resources.nodes, resources.cores) {
        if nodes.checked_mul(cores).is_none() {
            return configuration_error(format!(
                "Request of {nodes} nodes with {cores} cores each is too large"
            ));
        }
    }
    for fragment in renderer.render_nodes_and_cores(resources.nodes, resources.cores) {
        params.push(fragment);
    }
    if let Some(fragment) = resources
        .walltime
        .and_then(|walltime| renderer.render_walltime(&renderer.format_walltime(&walltime)))
    {
        params.push(fragment);
    }
    Ok(params)
}
