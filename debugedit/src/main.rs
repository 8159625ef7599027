use libdebugedit::args::Action;
use libdebugedit::args::HELP_TEXT;
use libdebugedit::args::USAGE_TEXT;

fn main() {
    match Action::parse(std::env::args().skip(1)) {
        Ok(Action::Edit(args)) => {
            if let Err(error) = libdebugedit::run(&args) {
                libdebugedit::error::report_error_and_exit(&error);
            }
        }
        Ok(Action::Version) => println!("debugedit {}", env!("CARGO_PKG_VERSION")),
        Ok(Action::Help) => println!("{HELP_TEXT}"),
        Ok(Action::Usage) => println!("{USAGE_TEXT}"),
        Err(error) => {
            eprintln!("debugedit: {error}");
            eprintln!("{USAGE_TEXT}");
            std::process::exit(1);
        }
    }
}
