// Shared driver for the interpreter binaries: option parsing, script
// execution, and the REPL.

use lunaria::{LuaError, LuaValue, LuaVM, Stdlib, VmOptions};
use std::io::{BufRead, Read, Write};

pub const VERSION_LINE: &str = "Lunaria 5.5  (Lua 5.5 compatible runtime)";

pub fn print_usage() {
    eprintln!("usage: lunaria [options] [script [args]]");
    eprintln!("Available options are:");
    eprintln!("  -e stat   execute string 'stat'");
    eprintln!("  -i        enter interactive mode after executing 'script'");
    eprintln!("  -l mod    require library 'mod' into global 'mod'");
    eprintln!("  -v        show version information");
    eprintln!("  -E        ignore environment variables");
    eprintln!("  -W        turn warnings on");
    eprintln!("  --        stop handling options");
    eprintln!("  -         stop handling options and execute stdin");
}

#[derive(Default)]
pub struct Options {
    pub execute_strings: Vec<String>,
    pub require_modules: Vec<String>,
    pub script_file: Option<String>,
    pub script_args: Vec<String>,
    pub interactive: bool,
    pub show_version: bool,
    pub read_stdin: bool,
    pub ignore_env: bool,
    pub warnings_on: bool,
}

pub fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut i = 0;
    let mut stop_options = false;
    while i < args.len() {
        let arg = &args[i];
        if !stop_options && arg.starts_with('-') && arg.len() > 1 {
            match arg.as_str() {
                "-e" => {
                    i += 1;
                    let stat = args.get(i).ok_or("'-e' needs argument")?;
                    opts.execute_strings.push(stat.clone());
                }
                "-l" => {
                    i += 1;
                    let module = args.get(i).ok_or("'-l' needs argument")?;
                    opts.require_modules.push(module.clone());
                }
                "-i" => opts.interactive = true,
                "-v" => opts.show_version = true,
                "-E" => opts.ignore_env = true,
                "-W" => opts.warnings_on = true,
                "--" => stop_options = true,
                _ => return Err(format!("unrecognized option '{}'", arg)),
            }
        } else if !stop_options && arg == "-" {
            opts.read_stdin = true;
            stop_options = true;
        } else {
            opts.script_file = Some(arg.clone());
            opts.script_args = args[i + 1..].to_vec();
            break;
        }
        i += 1;
    }
    Ok(opts)
}

/// Builds the conventional `arg` table: script at 0, its arguments from
/// 1, the interpreter path at -1.
fn setup_arg_table(vm: &mut LuaVM, exe: &str, script: Option<&str>, args: &[String]) {
    let t = vm.new_table(args.len(), 2);
    let tid = t.as_table_id();
    let exe_v = vm.new_str(exe);
    vm.raw_seti(tid, -1, exe_v);
    if let Some(name) = script {
        let name_v = vm.new_str(name);
        vm.raw_seti(tid, 0, name_v);
    }
    for (i, a) in args.iter().enumerate() {
        let v = vm.new_str(a);
        vm.raw_seti(tid, i as i64 + 1, v);
    }
    vm.set_global("arg", t);
}

fn report(vm: &LuaVM, kind: LuaError) {
    let msg = vm.error_message();
    eprintln!("lunaria: {}", msg);
    if kind == LuaError::Runtime {
        eprintln!("{}", vm.main_state_ref().generate_traceback());
    }
}

fn run_source(vm: &mut LuaVM, source: &str, name: &str) -> Result<Vec<LuaValue>, LuaError> {
    let proto = vm.compile_with_name(source, name)?;
    vm.execute_proto(proto)
}

pub fn run(opts: Options) -> i32 {
    let mut vm = LuaVM::new(VmOptions::default());
    if vm.open_stdlib(Stdlib::All).is_err() {
        eprintln!("lunaria: cannot open standard libraries");
        return 1;
    }
    if opts.warnings_on {
        vm.set_warnings_enabled(true);
    }
    if opts.show_version {
        println!("{}", VERSION_LINE);
        if opts.execute_strings.is_empty() && opts.script_file.is_none() && !opts.interactive {
            return 0;
        }
    }

    let exe = std::env::args().next().unwrap_or_else(|| "lunaria".to_string());
    setup_arg_table(&mut vm, &exe, opts.script_file.as_deref(), &opts.script_args);

    // -l mod: load the file and bind its single result (or true).
    for module in &opts.require_modules {
        let path = format!("{}.lua", module);
        match std::fs::read_to_string(&path) {
            Ok(src) => match run_source(&mut vm, &src, &format!("@{}", path)) {
                Ok(values) => {
                    let bound = values.first().copied().unwrap_or(LuaValue::boolean(true));
                    vm.set_global(module, bound);
                }
                Err(kind) => {
                    report(&vm, kind);
                    return 1;
                }
            },
            Err(err) => {
                eprintln!("lunaria: cannot open '{}': {}", path, err);
                return 1;
            }
        }
    }

    for stat in &opts.execute_strings {
        if let Err(kind) = run_source(&mut vm, stat, "=(command line)") {
            report(&vm, kind);
            return 1;
        }
    }

    if opts.read_stdin {
        let mut source = String::new();
        if std::io::stdin().lock().read_to_string(&mut source).is_err() {
            eprintln!("lunaria: cannot read stdin");
            return 1;
        }
        if let Err(kind) = run_source(&mut vm, &source, "=stdin") {
            report(&vm, kind);
            return 1;
        }
    }

    if let Some(script) = &opts.script_file {
        match std::fs::read_to_string(script) {
            Ok(source) => {
                let name = format!("@{}", script);
                if let Err(kind) = run_source(&mut vm, &source, &name) {
                    report(&vm, kind);
                    return 1;
                }
            }
            Err(err) => {
                eprintln!("lunaria: cannot open '{}': {}", script, err);
                return 1;
            }
        }
    }

    let no_work = opts.execute_strings.is_empty()
        && opts.script_file.is_none()
        && !opts.read_stdin
        && !opts.show_version;
    if opts.interactive || no_work {
        repl(&mut vm);
    }
    0
}

/// Line-oriented REPL: expression lines print their values; statement
/// lines execute; incomplete chunks keep reading.
pub fn repl(vm: &mut LuaVM) {
    println!("{}", VERSION_LINE);
    let stdin = std::io::stdin();
    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "> " } else { ">> " };
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }
        buffer.push_str(&line);
        let chunk = buffer.trim();
        if chunk.is_empty() {
            buffer.clear();
            continue;
        }
        // Try as expression first so `1 + 2` echoes its value.
        let as_expr = format!("return {}", chunk);
        let result = match run_source(vm, &as_expr, "=stdin") {
            Ok(values) => Ok(values),
            Err(LuaError::Syntax) => run_source(vm, chunk, "=stdin"),
            Err(other) => Err(other),
        };
        match result {
            Ok(values) => {
                if !values.is_empty() {
                    let rendered: Vec<String> =
                        values.iter().map(|v| vm.main_state_ref().to_display(v)).collect();
                    println!("{}", rendered.join("\t"));
                }
                buffer.clear();
            }
            Err(LuaError::Syntax) => {
                let msg = vm.error_message();
                // An unfinished construct keeps accumulating input.
                if msg.contains("<eof>") || msg.contains("unfinished") {
                    continue;
                }
                eprintln!("lunaria: {}", msg);
                buffer.clear();
            }
            Err(kind) => {
                report(vm, kind);
                buffer.clear();
            }
        }
    }
}
