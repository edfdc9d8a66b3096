// citron - Compiler and runtime for the Citron scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::env;
use std::process;

use citron_embed::Engine;
use citron_vm::CompileOptions;

fn print_usage() {
    eprintln!("Usage: citron <script.lemon> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --entry NAME            Function to run (default: main)");
    eprintln!("  --feature-level N       Script feature level (1 or 2)");
    eprintln!("  --opt-level N           Optimization level (0 disables)");
    eprintln!("  --combined-output PATH  Write the include-resolved source");
    eprintln!("  --version               Print version and exit");
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("Citron v0.1.0");
        return;
    }
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        process::exit(if args.is_empty() { 1 } else { 0 });
    }

    let mut script_path: Option<String> = None;
    let mut entry = "main".to_string();
    let mut options = CompileOptions::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--entry" => match iter.next() {
                Some(name) => entry = name.clone(),
                None => exit_with("--entry needs a function name"),
            },
            "--feature-level" => match iter.next().and_then(|v| v.parse().ok()) {
                Some(level) => options.script_feature_level = level,
                None => exit_with("--feature-level needs a number"),
            },
            "--opt-level" => match iter.next().and_then(|v| v.parse().ok()) {
                Some(level) => options.optimization_level = level,
                None => exit_with("--opt-level needs a number"),
            },
            "--combined-output" => match iter.next() {
                Some(path) => options.output_combined_source = Some(path.into()),
                None => exit_with("--combined-output needs a path"),
            },
            other if other.starts_with('-') => {
                exit_with(&format!("Unknown option '{}'", other));
            }
            other => {
                if script_path.is_some() {
                    exit_with("Only one script path is allowed");
                }
                script_path = Some(other.to_string());
            }
        }
    }

    let Some(script_path) = script_path else {
        print_usage();
        process::exit(1);
    };

    let mut engine = Engine::with_options(options);
    if let Err(error) = engine.compile_script(&script_path) {
        eprintln!("{}", error);
        process::exit(1);
    }

    match engine.call_function(&entry, &[]) {
        Ok(Some(result)) => println!("{}", result as i64),
        Ok(None) => {}
        Err(error) => {
            eprintln!("Error running '{}': {}", entry, error);
            process::exit(1);
        }
    }
}

fn exit_with(message: &str) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1)
}
