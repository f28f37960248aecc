mod support;

use datatest_stable::Utf8Path;
use lamina::Reader;
use support::{Machine, Trap};

#[derive(thiserror::Error, Debug)]
#[error("error(s) occured in program datatest at {0}")]
pub struct DatatestError(Box<Utf8Path>);

type DatatestFile<'a> = (Vec<&'a str>, Vec<&'a str>, String, Vec<&'a str>);

// Same layout as the frontend datatests: expected errors, then expected
// values (one line per top-level form), then the source. Running with
// DATATEST_EXPECT set rewrites the file from what actually happened.
fn stitch_to_datatest(
    error_section: impl AsRef<str>,
    value_section: impl AsRef<str>,
    source: impl AsRef<str>,
    comments: Vec<&str>,
) -> String {
    // comments always float to the top
    let mut lines = comments;
    lines.extend(error_section.as_ref().lines());
    lines.push("---");
    lines.extend(value_section.as_ref().lines());
    lines.push("---");
    lines.extend(source.as_ref().lines());
    lines.join("\n")
}

fn read_datatest(test_contents: &str) -> DatatestFile {
    let mut error_section = vec![];
    let mut value_section = vec![];
    let mut source = String::new();
    let mut comments = vec![];

    #[derive(PartialEq, Eq, Debug, Default)]
    enum Section {
        #[default]
        Error,
        Value,
        Source,
    }
    let mut section = Section::default();

    for line in test_contents.lines() {
        if line.trim_start().starts_with(';') && section != Section::Source {
            comments.push(line);
            continue;
        }

        match section {
            Section::Error => match line {
                s if s.trim_end() == "---" => section = Section::Value,
                esl => error_section.push(esl),
            },
            Section::Value => match line {
                s if s.trim_end() == "---" => section = Section::Source,
                vsl => value_section.push(vsl),
            },
            Section::Source => {
                if !source.is_empty() {
                    source.push('\n');
                }
                source.push_str(line);
            }
        }
    }

    (error_section, value_section, source, comments)
}

/// Evaluates each top-level form in order, stopping at the first failure.
fn evaluate(source: &str) -> (Vec<String>, Option<Trap>) {
    let machine = Machine::new();
    let mut compiler = machine.compiler();
    let mut values = vec![];
    for form in Reader::new(source) {
        let result = form
            .map_err(Trap::from)
            .and_then(|form| compiler.compile(&form).map_err(Trap::from))
            .and_then(|unit| machine.run(&unit));
        match result {
            Ok(value) => values.push(value.to_string()),
            Err(err) => return (values, Some(err)),
        }
    }
    (values, None)
}

fn program_test(path: &Utf8Path, contents: String) -> datatest_stable::Result<()> {
    let (expected_errors, expected_values, source, comments) = read_datatest(&contents);
    let (values, error) = evaluate(&source);
    let errors: Vec<String> = error.iter().map(|err| err.to_string()).collect();

    let mut mismatches = vec![];
    for i in 0..values.len().max(expected_values.len()) {
        let got = values.get(i).map(String::as_str);
        let expected = expected_values.get(i).map(|line| line.trim());
        if got != expected {
            mismatches.push((expected, got));
        }
    }
    for i in 0..errors.len().max(expected_errors.len()) {
        let got = errors.get(i).map(String::as_str);
        let expected = expected_errors.get(i).map(|line| line.trim());
        if got != expected {
            mismatches.push((expected, got));
        }
    }

    if std::env::var("DATATEST_EXPECT").is_ok() {
        std::fs::write(
            path,
            stitch_to_datatest(errors.join("\n"), values.join("\n"), source, comments),
        )?;
        Ok(())
    } else if !mismatches.is_empty() {
        println!("Program test {path} failed:\n  got -> expected");
        for (expected, got) in mismatches {
            println!(
                "  {} -> {}",
                got.unwrap_or("<not present>"),
                expected.unwrap_or("<not present>")
            )
        }
        Err(DatatestError(Box::from(path)))?
    } else {
        Ok(())
    }
}

datatest_stable::harness! {
    program_test, "tests/programs", r"^.*\.lam",
}
