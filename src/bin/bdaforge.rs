use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use bdaforge::backend::describe_system;
use bdaforge::compute::{ComputeRun, RunReport};
use bdaforge::config::{RunConfig, DEFAULT_ELEMENT_COUNT};
use bdaforge::{init_logging_default, SoftwareDevice, VulkanDevice};

#[derive(Parser, Debug)]
#[command(name = "bdaforge", version)]
#[command(
    about = "Run a compute program over buffers reached by device address",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the Vulkan layers and physical devices
    Devices {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Double every element of a u32 array on the device and verify it
    Run {
        /// Number of u32 elements
        #[arg(long, default_value_t = DEFAULT_ELEMENT_COUNT)]
        elements: u32,
        /// Compiled SPIR-V compute program
        #[arg(long)]
        shader: Option<PathBuf>,
        /// Index of the physical device (see `bdaforge devices`)
        #[arg(long, default_value_t = 0)]
        device: usize,
        /// Budget for the completion wait in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
        /// Execute on the host reference device instead of Vulkan
        #[arg(long)]
        software: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { json } => list_devices(json),
        Commands::Run {
            elements,
            shader,
            device,
            timeout_ms,
            software,
            json,
        } => {
            let mut config = RunConfig::new()
                .with_element_count(elements)
                .with_device_index(device)
                .with_wait_timeout(Duration::from_millis(timeout_ms));
            if let Some(shader) = shader {
                config = config.with_shader_path(shader);
            }
            config.validate()?;

            let report = if software {
                let device = SoftwareDevice::new();
                ComputeRun::new(&device, config).run()?
            } else {
                let device = VulkanDevice::new(&config).context("Vulkan device setup failed")?;
                ComputeRun::new(&device, config).run()?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if let Some(err) = report.verification.to_error() {
                anyhow::bail!(
                    "{} of {} elements mismatched; {}",
                    report.verification.mismatches,
                    report.element_count,
                    err
                );
            }
            Ok(())
        }
    }
}

fn list_devices(json: bool) -> anyhow::Result<()> {
    let system = describe_system(&RunConfig::new().limits)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&system)?);
    } else {
        println!("{}", system.to_string().trim_end());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("elements:        {}", report.element_count);
    println!(
        "buffers:         staging {} B, working {} B",
        report.staging_bytes, report.working_bytes
    );
    println!(
        "memory types:    staging {}, working {}, address table {}",
        report.memory_types.staging,
        report.memory_types.working,
        report.memory_types.address_table
    );
    if let Some(source) = report.address_source {
        println!("address source:  {}", source.entry_point());
    }
    for (i, address) in report.addresses.entries().iter().enumerate() {
        println!("address[{}]:      0x{:016x}", i, address);
    }
    println!("workgroups:      {}", report.workgroups);
    println!("wait:            {:.3} ms", report.wait_ms);
    println!("total:           {:.3} ms", report.total_ms);
    println!(
        "element 0:       {}",
        if report.verification.count_reached_program {
            "carries the element count"
        } else {
            "does not carry the element count"
        }
    );
    println!("sum of 1..=5:    {}", report.verification.leading_sum);
    println!(
        "result:          {}",
        if report.passed() { "verified" } else { "MISMATCH" }
    );
}
