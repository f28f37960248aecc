use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use codesnake::{Block, CodeWidth, Label, LineIndex};
use lamina::{
    classfile::{decode::ClassFile, Insn},
    reader::ReadErrorKind,
    CompileError, CompiledUnit, Compiler, CompilerOptions, Linker, ReadError, Reader,
};
use log::info;
use yansi::Paint;

/// Compile lamina forms to JVM class files.
#[derive(Parser, Debug)]
#[command(name = "lamina", version)]
struct Args {
    /// Source file to compile; starts an interactive session when absent
    file: Option<PathBuf>,
    /// Directory class files are written to
    #[arg(long, default_value = "out")]
    out: PathBuf,
    /// Internal-name prefix of generated classes
    #[arg(long, default_value = "lamina/gen/")]
    prefix: String,
    /// Don't print a disassembly of each compiled form
    #[arg(long)]
    no_dump: bool,
}

fn report_read_error(name: &str, src: &str, err: &ReadError) {
    let idx = LineIndex::new(src);
    let label = Label::new(err.span.clone())
        .with_text(err.to_string().red().to_string())
        .with_style(|s| s.red().to_string());
    match Block::new(&idx, [label]) {
        Some(block) => {
            let block = block.map_code(|c| CodeWidth::new(c, c.len()));
            println!("{}[{name}]", block.prologue());
            print!("{block}");
            println!("{}", block.epilogue());
        }
        None => println!("{} {err}", "error:".red().bold()),
    }
}

fn report_compile_error(err: &CompileError) {
    if err.is_internal() {
        println!("{} {err}", "internal compiler error:".red().bold());
    } else {
        println!("{} {err}", "error:".red().bold());
    }
}

fn paint_insn(insn: &Insn) -> String {
    let text = insn.to_string();
    match insn {
        Insn::Label(_) => text.dim().to_string(),
        Insn::Jump(..) | Insn::TableSwitch { .. } => text.yellow().to_string(),
        Insn::Invoke(..) | Insn::InvokeDynamic(_) => text.blue().to_string(),
        Insn::Field(..) | Insn::Type(..) => text.magenta().to_string(),
        Insn::PushInt(_) | Insn::PushLong(_) | Insn::Ldc(_) => text.cyan().to_string(),
        _ => text,
    }
}

fn dump(unit: &CompiledUnit) -> anyhow::Result<()> {
    for image in &unit.classes {
        let class = ClassFile::parse(&image.bytes)
            .with_context(|| format!("decoding {}", image.name))?;
        println!(
            "{} {} {} {}",
            "class".bold(),
            class.name.green().bold(),
            "extends".dim(),
            class.super_name
        );
        for field in &class.fields {
            println!("  {} {} {}", "field".bold(), field.name, field.descriptor.dim());
        }
        for method in &class.methods {
            let annotations = method
                .annotations
                .iter()
                .map(|a| format!("@{} ", a.descriptor))
                .collect::<String>();
            println!(
                "  {}{}{}",
                annotations.dim(),
                method.name.green(),
                method.descriptor.dim()
            );
            let Some(code) = &method.code else { continue };
            println!(
                "    {}",
                format!(
                    "stack={} locals={} frames={}",
                    code.max_stack,
                    code.max_locals,
                    code.stack_map.len()
                )
                .dim()
            );
            for (offset, insn) in &code.insns {
                println!("    {}: {}", format!("{offset:>5}").dim(), paint_insn(insn));
            }
        }
    }
    Ok(())
}

fn write_classes(out: &Path, unit: &CompiledUnit) -> anyhow::Result<()> {
    for image in &unit.classes {
        let path = out.join(format!("{}.class", image.name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, &image.bytes).with_context(|| format!("writing {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn compile_file(args: &Args, file: &Path) -> anyhow::Result<()> {
    let src = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let name = file.display().to_string();
    let linker = Linker::with_prelude();
    let mut compiler = Compiler::new(&linker).with_options(CompilerOptions {
        class_prefix: args.prefix.clone(),
        source_file: file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        ..Default::default()
    });

    let mut failed = false;
    for form in Reader::new(&src) {
        let form = match form {
            Ok(form) => form,
            Err(err) => {
                report_read_error(&name, &src, &err);
                failed = true;
                break;
            }
        };
        match compiler.compile(&form) {
            Ok(unit) => {
                if !args.no_dump {
                    dump(&unit)?;
                }
                write_classes(&args.out, &unit)?;
            }
            Err(err) => {
                report_compile_error(&err);
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("{name} did not compile cleanly");
    }
    Ok(())
}

fn interactive(args: &Args) -> anyhow::Result<()> {
    let linker = Linker::with_prelude();
    let mut compiler = Compiler::new(&linker).with_options(CompilerOptions {
        class_prefix: args.prefix.clone(),
        ..Default::default()
    });
    let mut readline = rustyline::DefaultEditor::new()?;
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { ">> " } else { ".. " };
        let Ok(input) = readline.readline(prompt) else {
            break;
        };
        if !pending.is_empty() {
            pending.push('\n');
        }
        pending.push_str(&input);

        let forms: Result<Vec<_>, _> = Reader::new(&pending).collect();
        let forms = match forms {
            // keep reading until the list closes
            Err(ReadError {
                kind: ReadErrorKind::Unclosed,
                ..
            }) => continue,
            Err(err) => {
                report_read_error("repl", &pending, &err);
                pending.clear();
                continue;
            }
            Ok(forms) => forms,
        };
        let _ = readline.add_history_entry(pending.as_str());
        pending.clear();

        for form in forms {
            match compiler.compile(&form) {
                Ok(unit) if !args.no_dump => dump(&unit)?,
                Ok(_) => {}
                Err(err) => report_compile_error(&err),
            }
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.file {
        Some(file) => compile_file(&args, file),
        None => interactive(&args),
    }
}
