use clap::Parser;
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use parx::mdl::{ModelCompiler, SeverityMap};
use std::error::Error;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;

#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model description file (.mdl)
    file: String,
    #[arg(short, long, help = "Write the compiled interpreter code to this file")]
    output: Option<PathBuf>,
    #[arg(long, help = "Print a listing of the compiled code")]
    dump: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let compiler = ModelCompiler::from_path(&args.file);

    if !compiler.diagnostics().is_empty() {
        let severities = SeverityMap::default();
        let mut files = SimpleFiles::new();
        let file_id = files.add(args.file.clone(), compiler.source().to_string());
        let writer = StandardStream::stderr(ColorChoice::Always);
        let config = codespan_reporting::term::Config::default();
        for diagnostic in compiler.diagnostics().iter().cloned() {
            let diagnostic =
                diagnostic.into_codespan_diagnostic(file_id, compiler.source(), &severities);
            codespan_reporting::term::emit(&mut writer.lock(), &config, &files, &diagnostic)?;
        }
    }

    let Some(code) = compiler.model_code() else {
        exit(1);
    };
    if args.dump {
        print!("{}", code.dump());
    }
    if let Some(path) = &args.output {
        let mut file = File::create(path)?;
        code.write(&mut file)?;
    }
    Ok(())
}
