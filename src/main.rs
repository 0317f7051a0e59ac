use lv_segment::backend::{MainAutoBackend, MainBackend};
use lv_segment::cli::{AppArgs, HELP, launch};

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let result = AppArgs::parse().and_then(|app_args| match app_args {
        Some(app_args) => {
            launch::<MainBackend, MainAutoBackend>(&app_args)?;
            Ok(app_args.is_idle())
        }
        None => Ok(true),
    });

    match result {
        Ok(true) => println!("{HELP}"),
        Ok(false) => {}
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}
