// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use songsync::mix::NB_CHANNELS;
use songsync::{InMemoryCatalog, LeadSheet, MidiMix, MidiMixManager, Settings, Song, TimeSignature, UserPhrase};

fn print_usage() {
    println!("songsync - Song structure and MIDI mix synchronization");
    println!();
    println!("Usage: songsync [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --demo                  Build a demo song and print its parts and mix");
    println!("  --check-mix <FILE>      Load a mix file against the demo catalog");
    println!("  --config <FILE>         Read settings from a YAML or TOML file");
    println!("  --help                  Show this help message");
}

fn init_logging(settings: &Settings) {
    let level = tracing::Level::from_str(&settings.log_level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn print_parts(song: &Song) {
    println!("Parts of '{}' ({} bars):", song.name(), song.size_in_bars());
    for part in song.structure().parts() {
        println!(
            "  {:>4} {:<8} bars {:>3}-{:<3} {:<6} {}",
            part.id().to_string(),
            part.name(),
            part.start_bar(),
            part.end_bar(),
            part.time_signature().to_string(),
            part.rhythm().name()
        );
    }
}

fn print_mix(mix: &MidiMix) {
    println!("Channels:");
    for channel in 0..NB_CHANNELS as u8 {
        match (mix.voice(channel), mix.instrument_mix(channel)) {
            (Some(voice), Some(instrument_mix)) => println!(
                "  {:>2} {:<28} {:<24} vol {:>3}{}",
                channel + 1,
                voice.to_string(),
                instrument_mix.instrument().patch_name,
                instrument_mix.settings().volume,
                if instrument_mix.is_mute() { " (mute)" } else { "" }
            ),
            _ => println!("  {:>2} -", channel + 1),
        }
    }
}

fn run_demo(settings: Settings) -> Result<()> {
    let catalog = Arc::new(InMemoryCatalog::demo());
    let mut lead_sheet = LeadSheet::new("A", TimeSignature::FOUR_FOUR, 12);
    lead_sheet.add_section("B", TimeSignature::THREE_FOUR, 4)?;
    lead_sheet.add_section("C", TimeSignature::FOUR_FOUR, 8)?;

    let song = Song::from_lead_sheet("Demo", &mut lead_sheet, catalog.clone());
    let manager = MidiMixManager::new(settings, catalog);
    let mix = manager.find_mix(&song)?;
    print_parts(&song);
    print_mix(&mix);

    println!();
    println!("Deleting bars 4-7...");
    lead_sheet.delete_bars(4, 4)?;
    print_parts(&song);
    print_mix(&mix);

    println!();
    println!("Adding user phrase 'Melody'...");
    song.add_user_phrase(UserPhrase::new("Melody", false))?;
    print_mix(&mix);
    Ok(())
}

fn check_mix(path: PathBuf) -> Result<()> {
    let catalog = InMemoryCatalog::demo();
    let mix = MidiMix::load(&path, &catalog)
        .with_context(|| format!("Invalid mix file: {:?}", path))?;
    print_mix(&mix);
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        println!("songsync - Song structure and MIDI mix synchronization");
        println!("Run with --help for usage information");
        return Ok(());
    }

    let mut settings = Settings::default();
    let mut command: Option<(String, Option<String>)> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let Some(path) = args.get(i + 1) else {
                    bail!("--config requires a file");
                };
                settings = Settings::load(path)?;
                i += 1;
            }
            "--demo" => command = Some(("demo".to_string(), None)),
            "--check-mix" => {
                let Some(path) = args.get(i + 1) else {
                    bail!("--check-mix requires a file");
                };
                command = Some(("check-mix".to_string(), Some(path.clone())));
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    init_logging(&settings);

    match command {
        Some((name, _)) if name == "demo" => run_demo(settings),
        Some((_, Some(path))) => check_mix(PathBuf::from(path)),
        _ => {
            print_usage();
            Ok(())
        }
    }
}
