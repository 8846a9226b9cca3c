//! glTF Tuner CLI
//!
//! Re-cluster glTF tiles and bake customized materials into them.

use clap::{Parser, Subcommand};
use glam::{DMat4, DVec3};
use gltf_tuner::config::TuningProject;
use gltf_tuner::material::InMemoryPersistence;
use gltf_tuner::{GltfModel, GltfTuner, MaterialRegistry, TunerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gltf-tuner")]
#[command(author, version, about = "Re-cluster glTF tiles and bake customized materials", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tune a binary glTF tile
    Tune {
        /// Input GLB file
        #[arg(short, long)]
        input: PathBuf,

        /// Output GLB file
        #[arg(short, long)]
        output: PathBuf,

        /// Tuning project (JSON): configuration, rules and material customizations
        #[arg(short, long)]
        project: Option<PathBuf>,

        /// Directory where textures are cached
        #[arg(long)]
        texture_dir: Option<PathBuf>,

        /// Source material ids to split primitives on (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_id)]
        split: Vec<u64>,
    },

    /// List the source materials declared by a tileset
    Materials {
        /// Path to tileset.json
        #[arg(short, long)]
        tileset: PathBuf,
    },

    /// Delete the texture cache directory
    FlushCache {
        #[arg(long)]
        texture_dir: PathBuf,
    },
}

fn parse_id(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("Invalid material id: '{}'", s))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tune {
            input,
            output,
            project,
            texture_dir,
            split,
        } => {
            tune_file(&input, &output, project.as_deref(), texture_dir, split)?;
        }
        Commands::Materials { tileset } => {
            list_materials(&tileset)?;
        }
        Commands::FlushCache { texture_dir } => {
            flush_cache(texture_dir)?;
        }
    }

    Ok(())
}

fn tune_file(
    input_path: &Path,
    output_path: &Path,
    project_path: Option<&Path>,
    texture_dir: Option<PathBuf>,
    split: Vec<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut project = match project_path {
        Some(path) => {
            info!("Loading project from {:?}...", path);
            TuningProject::load(path)?
        }
        None => TuningProject::default(),
    };
    if texture_dir.is_some() {
        project.config.texture_dir = texture_dir;
    }
    let config: TunerConfig = project.config.clone().with_split_materials(split);

    // Customizations are served through the persistence interface, like a host would.
    let persistence = Arc::new(InMemoryPersistence::new());
    for material in &project.materials {
        if let (Some(id), Some(definition)) = (material.id, &material.customization) {
            persistence.insert(&config.model_id, id, definition.clone());
        }
    }
    let registry = Arc::new(MaterialRegistry::with_persistence(
        config.model_id.clone(),
        persistence,
    ));
    {
        let mut state = registry.write();
        for material in &project.materials {
            match material.id {
                Some(id) => state.ingest_source_properties(id, material.properties.clone()),
                None => warn!("Ignoring project material without id"),
            }
        }
    }

    let tuner = GltfTuner::with_registry(config, registry);
    tuner.set_rules(project.rules.clone());

    info!("Loading tile from {:?}...", input_path);
    let model = GltfModel::from_glb(&fs::read(input_path)?)?;
    info!(
        "  {} meshes, {} materials",
        model.root.meshes.len(),
        model.root.materials.len()
    );

    let tile_transform = project
        .tile_transform
        .map_or(DMat4::IDENTITY, |m| DMat4::from_cols_array(&m));
    let root_translation = project.root_translation.map_or(DVec3::ZERO, DVec3::from);
    let tuned = tuner.tune(&model, tile_transform, root_translation)?;

    let primitives: usize = tuned.root.meshes.iter().map(|m| m.primitives.len()).sum();
    info!(
        "  Tuned into {} primitives, {} materials, {} textures",
        primitives,
        tuned.root.materials.len(),
        tuned.root.textures.len()
    );

    let glb = tuned.to_glb()?;
    fs::write(output_path, &glb)?;
    info!("Exported GLB ({} bytes) to {:?}", glb.len(), output_path);

    Ok(())
}

fn list_materials(tileset_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let tileset: serde_json::Value = serde_json::from_str(&fs::read_to_string(tileset_path)?)?;
    let tuner = GltfTuner::new(TunerConfig::default());
    if !tuner.parse_tileset_json(&tileset) {
        println!("No material list in {:?}", tileset_path);
        return Ok(());
    }

    let materials = tuner.material_info();
    println!("{} materials:", materials.len());
    for material in materials {
        println!("  {:#x}  {}", material.id, material.name);
    }

    Ok(())
}

fn flush_cache(texture_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let tuner = GltfTuner::new(TunerConfig::default().with_texture_dir(&texture_dir));
    tuner.registry().write().textures_mut().flush()?;
    println!("Flushed texture cache {:?}", texture_dir);
    Ok(())
}
