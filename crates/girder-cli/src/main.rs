//! CLI binary driving both girder cores: `build` plans and executes the
//! incremental action graph, `run` executes a build graph script.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use girder_build::{
    Action, BuildOptions, BuildSession, ExecutorRegistry, TargetDescriptor, TargetMakefile,
    ToolchainAdapter,
};
use girder_graph::{
    export_graph, Graph, GraphRunner, GraphRunnerOptions, TempStorage, TokenPolicy, TokenStore,
};

#[derive(Parser)]
#[command(name = "girder", version, about = "Two-tier build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute the incremental action graph for one or more targets
    Build {
        /// Target triple `name:platform:configuration`; repeatable
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,

        /// Action plan served to the engine when no cached makefile is valid
        #[arg(long)]
        actions: PathBuf,

        /// Engine root directory
        #[arg(long, default_value = ".")]
        engine_root: PathBuf,

        /// Directory for makefiles and cache archives
        #[arg(long)]
        intermediate: Option<PathBuf>,

        /// Project file the build is for
        #[arg(long)]
        project: Option<PathBuf>,

        /// Extra arguments recorded into (and validated against) makefiles
        #[arg(long = "arg")]
        additional_arguments: Vec<String>,

        /// Plan without executing
        #[arg(long)]
        skip_build: bool,

        /// Export the full linked action graph as JSON to this path
        #[arg(long)]
        export: Option<PathBuf>,

        /// Refuse builds that would modify engine files
        #[arg(long)]
        no_engine_changes: bool,

        /// Do not re-run dependents whose only stale input is an import library
        #[arg(long)]
        ignore_outdated_import_libraries: bool,

        /// Do not build targets implied as pre-build dependencies
        #[arg(long)]
        skip_prebuild_targets: bool,

        /// Dump the outdated action set as JSON before executing
        #[arg(long)]
        write_outdated_actions: Option<PathBuf>,

        /// Maximum concurrent actions
        #[arg(long, default_value_t = 4)]
        max_parallel: usize,
    },

    /// Execute a build graph script
    Run {
        /// Path to the parsed graph script (JSON)
        #[arg(long)]
        script: PathBuf,

        /// Target node or agent names; repeatable or `;`-joined
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Override a script property: `Prop=Value`
        #[arg(long = "set")]
        set: Vec<String>,

        /// Append to a script property: `Prop=Value`
        #[arg(long = "append")]
        append: Vec<String>,

        /// Activate a trigger by name
        #[arg(long)]
        trigger: Option<String>,

        /// Treat all triggers as activated
        #[arg(long)]
        skip_triggers: bool,

        /// Treat specific triggers as activated; `+`-joined
        #[arg(long = "skip-trigger")]
        skip_trigger: Vec<String>,

        /// Run a single node without its dependencies
        #[arg(long)]
        single_node: Option<String>,

        /// Print the execution plan and exit
        #[arg(long)]
        list_only: bool,

        /// Print the plan with dependency details and exit
        #[arg(long)]
        show_deps: bool,

        /// Wipe local temp storage before running
        #[arg(long)]
        clean: bool,

        /// Re-clean specific nodes; `+`-joined
        #[arg(long = "clean-node")]
        clean_node: Vec<String>,

        /// Skip nodes already marked complete
        #[arg(long)]
        resume: bool,

        /// Export the culled graph as JSON to this path
        #[arg(long)]
        export: Option<PathBuf>,

        /// Shared storage directory for cross-machine artifact exchange
        #[arg(long)]
        shared_storage_dir: Option<PathBuf>,

        /// Also write archived blocks to shared storage
        #[arg(long)]
        write_to_shared_storage: bool,

        /// Signature identifying this job on acquired tokens
        #[arg(long, default_value = "local")]
        token_signature: String,

        /// Drop nodes whose tokens are held elsewhere instead of failing
        #[arg(long)]
        skip_targets_without_tokens: bool,

        /// Workspace root the script operates in
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

/// Toolchain collaborator fed from a JSON action plan on disk.
struct JsonPlanToolchain {
    plan_path: PathBuf,
}

#[derive(serde::Deserialize)]
struct JsonPlan {
    actions: Vec<Action>,
    #[serde(default)]
    prebuild_targets: Vec<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

impl JsonPlanToolchain {
    fn load_plan(&self) -> girder_types::Result<JsonPlan> {
        let text = std::fs::read_to_string(&self.plan_path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait::async_trait]
impl ToolchainAdapter for JsonPlanToolchain {
    fn name(&self) -> &str {
        "json-plan"
    }

    async fn create_makefile(
        &self,
        target: &TargetDescriptor,
        session: &BuildSession,
    ) -> girder_types::Result<TargetMakefile> {
        let plan = self.load_plan()?;
        Ok(TargetMakefile {
            project_file: session.options.project_file.clone(),
            platform: target.platform.clone(),
            additional_arguments: session.options.additional_arguments.clone(),
            actions: plan.actions,
            module_outputs: Vec::new(),
            prebuild_targets: plan.prebuild_targets,
            prebuild_scripts: Vec::new(),
            environment: plan.environment,
            diagnostics: Vec::new(),
            memory_per_action_mb: 1024,
            source_files: BTreeMap::new(),
            working_set: BTreeSet::new(),
            generated_directories: BTreeMap::new(),
        })
    }

    async fn current_source_files(
        &self,
        _target: &TargetDescriptor,
    ) -> girder_types::Result<BTreeMap<String, BTreeSet<PathBuf>>> {
        Ok(BTreeMap::new())
    }

    async fn current_working_set(
        &self,
        _target: &TargetDescriptor,
    ) -> girder_types::Result<BTreeSet<PathBuf>> {
        Ok(BTreeSet::new())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let result = match cli.command {
        Commands::Build {
            targets,
            actions,
            engine_root,
            intermediate,
            project,
            additional_arguments,
            skip_build,
            export,
            no_engine_changes,
            ignore_outdated_import_libraries,
            skip_prebuild_targets,
            write_outdated_actions,
            max_parallel,
        } => {
            cmd_build(
                targets,
                actions,
                engine_root,
                intermediate,
                project,
                additional_arguments,
                skip_build,
                export,
                no_engine_changes,
                ignore_outdated_import_libraries,
                skip_prebuild_targets,
                write_outdated_actions,
                max_parallel,
            )
            .await
        }
        Commands::Run {
            script,
            targets,
            set,
            append,
            trigger,
            skip_triggers,
            skip_trigger,
            single_node,
            list_only,
            show_deps,
            clean,
            clean_node,
            resume,
            export,
            shared_storage_dir,
            write_to_shared_storage,
            token_signature,
            skip_targets_without_tokens,
            workspace,
        } => {
            cmd_run(RunArgs {
                script,
                targets,
                set,
                append,
                trigger,
                skip_triggers,
                skip_trigger,
                single_node,
                list_only,
                show_deps,
                clean,
                clean_node,
                resume,
                export,
                shared_storage_dir,
                write_to_shared_storage,
                token_signature,
                skip_targets_without_tokens,
                workspace,
            })
            .await
        }
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_build(
    targets: Vec<String>,
    actions: PathBuf,
    engine_root: PathBuf,
    intermediate: Option<PathBuf>,
    project: Option<PathBuf>,
    additional_arguments: Vec<String>,
    skip_build: bool,
    export: Option<PathBuf>,
    no_engine_changes: bool,
    ignore_outdated_import_libraries: bool,
    skip_prebuild_targets: bool,
    write_outdated_actions: Option<PathBuf>,
    max_parallel: usize,
) -> girder_types::Result<()> {
    let engine_root = std::fs::canonicalize(&engine_root)?;
    let intermediate = intermediate.unwrap_or_else(|| engine_root.join("Intermediate"));

    let descriptors = targets
        .iter()
        .map(|t| TargetDescriptor::parse(t))
        .collect::<girder_types::Result<Vec<_>>>()?;

    let mut options = BuildOptions::new(&engine_root, intermediate);
    if let Some(project) = project {
        options.project_file = project;
    }
    options.additional_arguments = additional_arguments;
    options.skip_build = skip_build;
    options.export = export;
    options.no_engine_changes = no_engine_changes;
    options.ignore_outdated_import_libraries = ignore_outdated_import_libraries;
    options.skip_prebuild_targets = skip_prebuild_targets;
    options.write_outdated_actions = write_outdated_actions;
    options.max_parallel_actions = max_parallel;

    let session = BuildSession::new(options);
    let toolchain = JsonPlanToolchain { plan_path: actions };
    let executor = ExecutorRegistry::with_defaults(max_parallel)
        .select()
        .expect("the local executor is always available");

    let outcome = session
        .build_targets(&descriptors, &toolchain, executor.as_ref())
        .await?;

    println!(
        "{} action(s) planned, {} outdated{}",
        outcome.planned_actions,
        outcome.outdated_actions,
        if outcome.executed { "" } else { " (not executed)" }
    );
    Ok(())
}

struct RunArgs {
    script: PathBuf,
    targets: Vec<String>,
    set: Vec<String>,
    append: Vec<String>,
    trigger: Option<String>,
    skip_triggers: bool,
    skip_trigger: Vec<String>,
    single_node: Option<String>,
    list_only: bool,
    show_deps: bool,
    clean: bool,
    clean_node: Vec<String>,
    resume: bool,
    export: Option<PathBuf>,
    shared_storage_dir: Option<PathBuf>,
    write_to_shared_storage: bool,
    token_signature: String,
    skip_targets_without_tokens: bool,
    workspace: PathBuf,
}

fn parse_assignment(spec: &str) -> girder_types::Result<(String, String)> {
    spec.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| {
            girder_types::GirderError::InvalidArgument(format!(
                "expected Property=Value, got '{spec}'"
            ))
        })
}

fn split_multi(values: &[String], separator: char) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(separator))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn cmd_run(args: RunArgs) -> girder_types::Result<()> {
    let workspace = std::fs::canonicalize(&args.workspace)?;
    let mut graph = Graph::load(&args.script)?;

    for assignment in &args.set {
        let (key, value) = parse_assignment(assignment)?;
        graph.properties.insert(key, value);
    }
    for assignment in &args.append {
        let (key, value) = parse_assignment(assignment)?;
        graph
            .properties
            .entry(key)
            .and_modify(|existing| {
                existing.push(';');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let mut storage = TempStorage::new(&workspace, workspace.join(".girder/storage"));
    if let Some(shared) = &args.shared_storage_dir {
        storage = storage.with_shared(shared, args.write_to_shared_storage);
    }

    let options = GraphRunnerOptions {
        targets: split_multi(&args.targets, ';'),
        single_node: args.single_node,
        trigger: args.trigger,
        skip_triggers: args.skip_triggers,
        skipped_triggers: split_multi(&args.skip_trigger, '+'),
        resume: args.resume,
        clean: args.clean,
        clean_nodes: split_multi(&args.clean_node, '+'),
        list_only: args.list_only,
        show_deps: args.show_deps,
        token_policy: if args.skip_targets_without_tokens {
            TokenPolicy::SkipMissing
        } else {
            TokenPolicy::FailFast
        },
    };

    let exported_graph = graph.clone();
    let runner = GraphRunner::new(
        graph,
        &workspace,
        storage,
        TokenStore::new(args.token_signature),
        options,
    );

    if let Some(path) = &args.export {
        let plan = runner.plan()?;
        let doc = export_graph(&exported_graph, &plan);
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
        println!("exported {} node(s) to {}", plan.len(), path.display());
        return Ok(());
    }

    let result = runner.run().await?;
    println!(
        "{} node(s) executed, {} skipped",
        result.executed_nodes.len(),
        result.skipped_nodes.len()
    );
    Ok(())
}
