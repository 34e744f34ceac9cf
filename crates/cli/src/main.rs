//! The main entrypoint for the slotup CLI.

fn main() {
    slotup_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    std::process::exit(slotup_lib::cli::main())
}
