use std::{env, process::ExitCode};

use cml::{
    Engine, FixedBaseClassManager, FixedBaseFileResolver, StreamParseErrorHandler, StreamRuntimeErrorHandler,
};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: cml <base-dir> <class-path> [args...]");
        eprintln!("example: cml ./macros MEng.User.Tests.Hello \"Alice\"");
        return ExitCode::FAILURE;
    }
    let base_dir = &args[1];
    let class_path = &args[2];
    let arg_line = args[3..].join(" ");

    let mut engine = Engine::new();
    engine.set_file_resolver(Box::new(FixedBaseFileResolver::new(base_dir)));
    engine.set_runtime_error_handler(Box::new(StreamRuntimeErrorHandler::new(std::io::stderr())));

    let mut manager = FixedBaseClassManager::new(base_dir);
    let mut errors = StreamParseErrorHandler::new(std::io::stderr());
    if engine.parse(class_path, &mut errors, &mut manager).is_none() {
        eprintln!("error: '{class_path}' did not parse");
        return ExitCode::FAILURE;
    }

    let instance = match engine.make_storage(class_path, false) {
        Ok(instance) => instance,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = engine.invoke_default_ctor(instance) {
        eprintln!("error: {err}");
        engine.free_value(instance);
        return ExitCode::FAILURE;
    }

    let code = engine.run_with_arg_line(instance, &arg_line);
    engine.free_value(instance);
    println!("exit code: {code}");

    // keep the process exit meaningful for scripts
    if code == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
