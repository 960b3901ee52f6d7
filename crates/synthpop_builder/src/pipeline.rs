//! YAML pipelines
//!
//! A pipeline names the population totals, then an ordered list of stages.
//! Order is load-bearing: every stage conditions on attributes the earlier
//! stages stamped.
//!
//! ```yaml
//! name: eindhoven
//! seed: 7
//! group_key: neighb_code
//! population: { path: population.csv, dims: [neighb_code] }
//! snapshots: { dir: snapshots, prefix: eindhoven }
//! output: out
//! stages:
//!   - kind: assign
//!     attribute: gender
//!     joint: { path: gender.csv }
//!   - kind: derive_bands
//!     source: age
//!     target: age_group
//!     bands: ["0-15", "15-65", "65+"]
//!   - kind: households
//!     catalog: households.yaml
//! ```
//!
//! With `snapshots` set, stage `i` (1-based) is stored as version `i` and
//! reused on the next run until an earlier stage has to be recomputed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use synthpop_core::household::{assign_principal_earner, count_members_with, label_household_classes};
use synthpop_core::{
    derive_attribute, fit, instantiate, AgeBands, CompositionCorrector, ConditionalAttributeAssigner, Constraint,
    ContingencyTable, FitValidator, HouseholdGrouper, SynthConfig,
};

use crate::ingest::{self, resolve, TableSource};
use crate::{human_bytes, PopulationState, SnapshotStore, StageSnapshot, StageStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    #[default]
    Default,
    Strict,
    Exploratory,
}

impl Preset {
    pub fn config(self) -> SynthConfig {
        match self {
            Preset::Default => SynthConfig::default(),
            Preset::Strict => SynthConfig::strict(),
            Preset::Exploratory => SynthConfig::exploratory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub dir: PathBuf,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    pub name: String,
    #[serde(default)]
    pub preset: Preset,
    pub seed: Option<u64>,
    pub group_key: String,
    /// Per-group population totals
    pub population: TableSource,
    #[serde(default)]
    pub snapshots: Option<SnapshotSettings>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    pub stages: Vec<Stage>,
}

fn default_output() -> PathBuf {
    PathBuf::from("output")
}

/// Which units an assignment stage stamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[default]
    Agents,
    Households,
}

/// Margin the assigned counts must honour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginSource {
    /// Dimensions the margin is enforced over (the group key is implied)
    pub over: Vec<String>,
    pub source: TableSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySpec {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountSpec {
    pub attribute: String,
    pub value: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stage {
    /// Stamp one attribute from a (optionally fitted) joint distribution.
    Assign {
        attribute: String,
        #[serde(default)]
        units: UnitKind,
        joint: TableSource,
        /// Margins the joint is fitted to before assignment
        #[serde(default)]
        fit_to: Vec<TableSource>,
        #[serde(default)]
        margins: Vec<MarginSource>,
    },
    /// Bin an integer attribute into labelled bands.
    DeriveBands {
        source: String,
        target: String,
        bands: Vec<String>,
    },
    /// Form households, then relabel them to their realized composition.
    Households {
        catalog: PathBuf,
        /// One-person type that takes every agent left without a household
        #[serde(default)]
        absorb_leftovers: Option<String>,
        #[serde(default = "default_true")]
        correct: bool,
        /// Expected household table to score the result against
        #[serde(default)]
        expected: Option<TableSource>,
    },
    /// Household attributes derived from members.
    Enrich {
        #[serde(default)]
        class_attribute: Option<String>,
        #[serde(default)]
        principal_earner: Vec<CopySpec>,
        #[serde(default)]
        member_counts: Vec<CountSpec>,
    },
}

fn default_true() -> bool {
    true
}

impl Stage {
    /// Label recorded with the stage's snapshot.
    pub fn label(&self) -> String {
        match self {
            Stage::Assign { attribute, units, .. } => match units {
                UnitKind::Agents => format!("assign {}", attribute),
                UnitKind::Households => format!("assign household {}", attribute),
            },
            Stage::DeriveBands { target, .. } => format!("derive {}", target),
            Stage::Households { .. } => "households".to_string(),
            Stage::Enrich { .. } => "enrich households".to_string(),
        }
    }
}

/// A loaded pipeline with its paths resolved against the YAML file's directory.
#[derive(Debug, Clone)]
pub struct Pipeline {
    file: PipelineFile,
    base_dir: PathBuf,
    config: SynthConfig,
}

impl Pipeline {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline: {}", path.display()))?;
        let file: PipelineFile =
            serde_yaml::from_str(&yaml).with_context(|| format!("Failed to parse pipeline: {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::new(file, base_dir)
    }

    pub fn new(file: PipelineFile, base_dir: PathBuf) -> Result<Self> {
        let mut config = file.preset.config();
        if let Some(seed) = file.seed {
            config = config.with_seed(seed);
        }
        let config = config.validated()?;
        Ok(Self {
            file,
            base_dir,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn output_dir(&self) -> PathBuf {
        resolve(&self.base_dir, &self.file.output)
    }

    /// Run every stage in order, resuming from snapshots where possible.
    pub fn run(&self) -> Result<PopulationState> {
        let mut state = self.initial_state()?;
        let store = self
            .file
            .snapshots
            .as_ref()
            .map(|s| SnapshotStore::new(resolve(&self.base_dir, &s.dir), &s.prefix));

        let total = self.file.stages.len();
        let mut resuming = true;
        for (i, stage) in self.file.stages.iter().enumerate() {
            let version = i as u32 + 1;
            let label = stage.label();
            println!("▶ [{}/{}] {}", version, total, label);

            match &store {
                Some(store) if resuming => {
                    match store.perform_stage(version, &label, &mut state, |state| self.execute(stage, state))? {
                        StageStatus::Loaded => println!("   ↺ Loaded snapshot v{}", version),
                        StageStatus::Computed(meta) => {
                            resuming = false;
                            println!("   💾 Snapshot v{} ({})", version, human_bytes(meta.compressed_size));
                        }
                    }
                }
                Some(store) => {
                    self.execute(stage, &mut state)?;
                    let meta = store.save(&StageSnapshot {
                        version,
                        stage: label,
                        state: state.clone(),
                    })?;
                    println!("   💾 Snapshot v{} ({})", version, human_bytes(meta.compressed_size));
                }
                None => self.execute(stage, &mut state)?,
            }
        }
        Ok(state)
    }

    fn initial_state(&self) -> Result<PopulationState> {
        let source = self.file.population.resolved(&self.base_dir);
        let (table, stats) = ingest::read_table(&source)?;
        report_parse(&source, stats.failed);
        if table.dims().len() != 1 || table.dims()[0] != self.file.group_key {
            anyhow::bail!(
                "Population table must have the single dimension '{}', found {:?}",
                self.file.group_key,
                table.dims()
            );
        }
        let totals = ingest::group_totals(&table)?;
        Ok(PopulationState {
            agents: instantiate(&self.file.group_key, &totals),
            ..PopulationState::default()
        })
    }

    fn read(&self, source: &TableSource) -> Result<ContingencyTable> {
        let source = source.resolved(&self.base_dir);
        let (table, stats) = ingest::read_table(&source)?;
        report_parse(&source, stats.failed);
        Ok(table)
    }

    fn execute(&self, stage: &Stage, state: &mut PopulationState) -> Result<()> {
        match stage {
            Stage::Assign {
                attribute,
                units,
                joint,
                fit_to,
                margins,
            } => self.assign(state, attribute, *units, joint, fit_to, margins),
            Stage::DeriveBands { source, target, bands } => {
                let bands = AgeBands::parse(bands)?;
                let skipped = derive_attribute(&mut state.agents, source, target, |value| {
                    value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .and_then(|age| bands.band_of(age))
                        .map(str::to_string)
                })?;
                if skipped > 0 {
                    eprintln!("Warning: {} agents have no band for '{}'", skipped, source);
                }
                Ok(())
            }
            Stage::Households {
                catalog,
                absorb_leftovers,
                correct,
                expected,
            } => self.form_households(state, catalog, absorb_leftovers.as_deref(), *correct, expected.as_ref()),
            Stage::Enrich {
                class_attribute,
                principal_earner,
                member_counts,
            } => {
                if let Some(attribute) = class_attribute {
                    label_household_classes(&mut state.households, attribute)?;
                }
                if !principal_earner.is_empty() {
                    let copies: Vec<(&str, &str)> = principal_earner
                        .iter()
                        .map(|c| (c.from.as_str(), c.to.as_str()))
                        .collect();
                    assign_principal_earner(
                        &mut state.households,
                        &state.agents,
                        &self.config.grouping.age_attribute,
                        &copies,
                    )?;
                }
                for count in member_counts {
                    let total = count_members_with(
                        &mut state.households,
                        &state.agents,
                        &count.attribute,
                        &count.value,
                        &count.target,
                    )?;
                    println!("   {} = {}: {} members", count.attribute, count.value, total);
                }
                Ok(())
            }
        }
    }

    fn assign(
        &self,
        state: &mut PopulationState,
        attribute: &str,
        units: UnitKind,
        joint: &TableSource,
        fit_to: &[TableSource],
        margins: &[MarginSource],
    ) -> Result<()> {
        let validator = FitValidator::new(self.config.validation.clone());
        let mut joint = self.read(joint)?;

        if !fit_to.is_empty() {
            let mut constraints = Vec::with_capacity(fit_to.len());
            for source in fit_to {
                let (constraint, dropped) = Constraint::from_margin(self.read(source)?).restricted_to(&joint)?;
                if dropped > 0 {
                    eprintln!(
                        "Warning: {} rows of {} have no support in the joint, dropped",
                        dropped,
                        source.path.display()
                    );
                }
                constraints.push(constraint);
            }
            let outcome = fit(&joint, &constraints, &self.config.fit)?;
            if !outcome.converged {
                eprintln!(
                    "Warning: fitting {} stopped after {} iterations (deviation {:.2e})",
                    attribute, outcome.iterations, outcome.max_deviation
                );
            }
            for constraint in &constraints {
                let context = format!("fit {} to {}", attribute, constraint.dims().join("×"));
                let report = validator.validate_fitted(&outcome, constraint, &context)?;
                state.scorecard.record(attribute, report);
            }
            joint = outcome.table;
        }

        let margin_tables = margins
            .iter()
            .map(|m| Ok((m.over.clone(), self.read(&m.source)?)))
            .collect::<Result<Vec<(Vec<String>, ContingencyTable)>>>()?;
        let mut assigner = ConditionalAttributeAssigner::new(&joint, attribute, &self.file.group_key)
            .with_config(self.config.assign.clone());
        for (over, table) in &margin_tables {
            assigner = assigner.with_margin(over, table);
        }

        let report = match units {
            UnitKind::Agents => assigner.run(&mut state.agents)?,
            UnitKind::Households => assigner.run(&mut state.households)?,
        };
        println!(
            "   ✅ {} units over {} groups (margin error {}, uniform fallbacks {})",
            report.assigned,
            report.groups,
            report.total_margin_error(),
            report.uniform_fallbacks.len()
        );

        for (over, table) in &margin_tables {
            let mut dims = over.clone();
            if table.has_dim(&self.file.group_key) && !dims.contains(&self.file.group_key) {
                dims.insert(0, self.file.group_key.clone());
            }
            let context = format!("{} margin {}", attribute, dims.join("×"));
            let fit_report = match units {
                UnitKind::Agents => validator.validate_population(&state.agents, table, &dims, &context)?,
                UnitKind::Households => validator.validate_population(&state.households, table, &dims, &context)?,
            };
            state.scorecard.record(attribute, fit_report);
        }
        Ok(())
    }

    fn form_households(
        &self,
        state: &mut PopulationState,
        catalog: &Path,
        absorb_leftovers: Option<&str>,
        correct: bool,
        expected: Option<&TableSource>,
    ) -> Result<()> {
        let catalog = ingest::load_catalog(&resolve(&self.base_dir, catalog))?;
        let mut outcome = HouseholdGrouper::new(&catalog, &self.file.group_key)
            .with_config(self.config.grouping.clone())
            .run(&mut state.agents)?;

        if let Some(name) = absorb_leftovers {
            outcome.absorb_leftovers(&mut state.agents, catalog.get(name)?)?;
        }
        println!(
            "   ✅ {} households, {} agents placed, {} unassigned, {} degraded",
            outcome.households.len(),
            outcome.assigned_agents(),
            outcome.unassigned.len(),
            outcome.degraded.len()
        );
        if !outcome.unassigned.is_empty() {
            eprintln!("Warning: {} agents left without a household", outcome.unassigned.len());
        }

        if correct {
            let report = CompositionCorrector::new(&catalog)
                .with_position_attribute(&self.config.grouping.position_attribute)
                .correct(&mut outcome.households, &mut state.agents)?;
            println!(
                "   🔧 Relabeled {} households ({} positions rewritten)",
                report.relabeled.len(),
                report.positions_rewritten
            );
        }
        state.households = outcome.households;

        if let Some(source) = expected {
            let table = self.read(source)?;
            let validator = FitValidator::new(self.config.validation.clone());
            let report = validator.validate_population(&state.households, &table, table.dims(), "households")?;
            state.scorecard.record("households", report);
        }
        Ok(())
    }

    /// Write agents, households and the scorecard as CSV.
    ///
    /// # Returns
    ///
    /// Paths written
    pub fn write_outputs(&self, state: &PopulationState) -> Result<Vec<PathBuf>> {
        let dir = self.output_dir();
        let mut written = Vec::new();

        let agents = dir.join("agents.csv");
        ingest::write_agents(&agents, &state.agents)?;
        written.push(agents);

        if !state.households.is_empty() {
            let households = dir.join("households.csv");
            ingest::write_households(&households, &state.households)?;
            written.push(households);
        }

        let scorecard = dir.join("scorecard.csv");
        ingest::write_scorecard(&scorecard, &state.scorecard)?;
        written.push(scorecard);
        Ok(written)
    }
}

fn report_parse(source: &TableSource, failed: u32) {
    if failed > 0 {
        eprintln!("Warning: {} rows of {} skipped", failed, source.path.display());
    }
}

/// Number of agents placed in a household.
pub fn placed_agents(state: &PopulationState) -> usize {
    state.households.iter().map(|h| h.hh_size()).sum()
}
