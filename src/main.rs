fn main() -> Result<(), Box<dyn std::error::Error>> {
    pagepilot::cli::main()
}
