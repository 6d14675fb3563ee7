//! NVGPU operation model
//!
//! Textual format, verifier and multi-threaded simulator for the NVIDIA
//! asynchronous data-movement and matrix operations:
//! - `cp.async` copies with commit groups and bounded waits
//! - multi-phase mbarriers with transaction counting
//! - TMA tensor-map descriptors, tiled loads with multicast, and stores
//! - warp-group MMA with matrix descriptors and accumulators
//! - warp-level `mma.sync` and approximate reciprocal
//!
//! # Architecture
//!
//! ```text
//! Source → Lexer → Parser → Program → Verifier → Interpreter (sim)
//! ```
//!
//! # Example
//!
//! ```mlir
//! %c0 = arith.constant 0
//! %c1 = arith.constant 1
//! %bar = nvgpu.mbarrier.create : !nvgpu.mbarrier.group<memorySpace = 3, num_barriers = 1>
//! nvgpu.mbarrier.init %bar[%c0], %c1
//! %tok = nvgpu.mbarrier.arrive %bar[%c0]
//! %done = nvgpu.mbarrier.test.wait %bar[%c0], %tok
//! vector.print %done
//! ```

pub mod common;
pub mod config;
pub mod diagnostics;
pub mod interp;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod sim;
pub mod verify;

// Re-export diagnostics for convenience
pub use diagnostics::{Errors, ProgramError, Reporter, SourceFile, VerifyError};

// Re-exports for convenience
pub use config::SimConfig;
pub use interp::{Execution, Interpreter};
pub use ir::Program;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse source text into a program
pub fn parse(source: &str) -> miette::Result<Program> {
    parse_file(&SourceFile::new("<input>", source))
}

/// Parse a named source file into a program
pub fn parse_file(file: &SourceFile) -> miette::Result<Program> {
    let tokens = lexer::lex_file(file)?;
    let program = parser::parse(&tokens, file)?;
    Ok(program)
}

/// Verify a parsed program, collecting every violation
pub fn verify(program: &Program, file: &SourceFile) -> Result<(), Errors> {
    let mut reporter = Reporter::new(file.clone());
    verify::verify_program(program, &mut reporter);
    if reporter.has_errors() {
        return Err(Errors::from_reporter(reporter));
    }
    Ok(())
}

/// Parse and verify
pub fn check(source: &str) -> miette::Result<Program> {
    let file = SourceFile::new("<input>", source);
    let program = parse_file(&file)?;
    verify(&program, &file)?;
    Ok(program)
}

/// Parse, verify and run on a simulated block
pub fn run(source: &str, config: SimConfig) -> miette::Result<Execution> {
    run_file(&SourceFile::new("<input>", source), config)
}

pub fn run_file(file: &SourceFile, config: SimConfig) -> miette::Result<Execution> {
    let program = parse_file(file)?;
    verify(&program, file)?;
    let mut interpreter = Interpreter::new(config)?;
    let execution = interpreter.run(&program, file)?;
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_run_prints() {
        let exec = run(
            "%c = arith.constant 7 : i32\nvector.print %c",
            SimConfig::new(2),
        )
        .unwrap();
        assert_eq!(exec.output, vec!["7", "7"]);
    }
}
