//! JavaScript Worker
//!
//! **Responsibility:**
//! Evaluate one script with boa inside a process of its own, so the
//! parent can kill a runaway script like any other program.
//!
//! A binary hosts the worker by calling [`run_if_requested`] first thing
//! in `main`. When started with [`WORKER_ARG`] the process reads the
//! source from stdin, evaluates it and reports progress on stdout as one
//! JSON [`WorkerFrame`] per line, then exits 0. Exit code and frames
//! together tell the parent how the script ended.

use super::process::TRUNCATION_MARKER;
use crate::sink::Stream;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsNativeErrorKind, JsResult, JsValue, NativeFunction,
    Source,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::{Read, Write};

/// First argument that switches a hosting binary into worker mode
pub const WORKER_ARG: &str = "--polyglot-js-worker";

const RECURSION_LIMIT: usize = 512;

/// Installs `console` and `print` on top of the two native writers, then
/// removes the raw writers from the global scope
const CONSOLE_PRELUDE: &str = r#"
(function (g) {
    var writeOut = g.__polyglot_stdout;
    var writeErr = g.__polyglot_stderr;
    function show(v) {
        if (typeof v === 'string') return v;
        if (v === undefined) return 'undefined';
        if (typeof v === 'function' || typeof v === 'symbol') return String(v);
        if (v instanceof Error) return String(v);
        try {
            var s = JSON.stringify(v);
            return s === undefined ? String(v) : s;
        } catch (e) {
            return String(v);
        }
    }
    function join(args) {
        var parts = [];
        for (var i = 0; i < args.length; i++) parts.push(show(args[i]));
        return parts.join(' ');
    }
    var out = function () { writeOut(join(arguments)); };
    var err = function () { writeErr(join(arguments)); };
    g.console = { log: out, info: out, debug: out, warn: err, error: err };
    g.print = out;
    delete g.__polyglot_stdout;
    delete g.__polyglot_stderr;
})(globalThis);
"#;

/// One line of worker output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFrame {
    Stdout { data: String },
    Stderr { data: String },
    /// Script threw; nothing follows
    Threw { message: String },
    /// Loop iteration limit reached; reported like a timeout
    LoopLimit,
    /// Output budget spent; the worker stops here
    OutputLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub loop_iteration_limit: u64,
    pub max_output_bytes: usize,
}

impl WorkerSettings {
    /// Arguments that start a hosting binary in worker mode
    pub fn to_args(&self) -> Vec<String> {
        vec![
            WORKER_ARG.to_string(),
            self.loop_iteration_limit.to_string(),
            self.max_output_bytes.to_string(),
        ]
    }

    fn from_args(args: &[String]) -> Option<Self> {
        match args {
            [flag, loop_limit, max_output] if flag == WORKER_ARG => Some(Self {
                loop_iteration_limit: loop_limit.parse().ok()?,
                max_output_bytes: max_output.parse().ok()?,
            }),
            _ => None,
        }
    }
}

/// Run as a worker when the process was started as one.
///
/// Returns the exit code to terminate with, or `None` when the process is
/// not a worker and `main` should carry on.
pub fn run_if_requested() -> Option<i32> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) != Some(WORKER_ARG) {
        return None;
    }
    let Some(settings) = WorkerSettings::from_args(&args) else {
        eprintln!(
            "usage: {} <loop-iteration-limit> <max-output-bytes>",
            WORKER_ARG
        );
        return Some(2);
    };

    let mut code = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut code) {
        eprintln!("Failed to read script from stdin: {}", e);
        return Some(1);
    }

    match evaluate(&code, settings, Box::new(std::io::stdout()), true) {
        Ok(()) => Some(0),
        Err(e) => {
            eprintln!("Failed to prepare JavaScript context: {}", e);
            Some(1)
        }
    }
}

struct Console {
    out: Box<dyn Write>,
    remaining: usize,
    spent: bool,
    exit_when_spent: bool,
}

impl Console {
    fn write(&mut self, frame: &WorkerFrame) {
        let Ok(mut line) = serde_json::to_string(frame) else {
            return;
        };
        line.push('\n');
        // Parent gone means nobody is listening anymore
        let _ = self.out.write_all(line.as_bytes());
        let _ = self.out.flush();
    }

    /// Emit `text` within the output budget; false once the budget is spent
    fn output(&mut self, stream: Stream, mut text: String) -> bool {
        if self.spent {
            return false;
        }
        if text.len() <= self.remaining {
            self.remaining -= text.len();
            self.write(&data_frame(stream, text));
            return true;
        }

        let mut cut = self.remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
        self.remaining = 0;
        self.spent = true;
        self.write(&data_frame(stream, text));
        self.write(&WorkerFrame::OutputLimit);
        if self.exit_when_spent {
            std::process::exit(0);
        }
        false
    }
}

fn data_frame(stream: Stream, data: String) -> WorkerFrame {
    match stream {
        Stream::Stdout => WorkerFrame::Stdout { data },
        Stream::Stderr => WorkerFrame::Stderr { data },
    }
}

thread_local! {
    // Evaluation is synchronous on one thread, so the native console
    // functions find their output here
    static CONSOLE: RefCell<Option<Console>> = const { RefCell::new(None) };
}

/// Clears the thread-local console when evaluation ends, however it ends
struct ConsoleScope;

impl ConsoleScope {
    fn install(console: Console) -> Self {
        CONSOLE.with(|slot| *slot.borrow_mut() = Some(console));
        ConsoleScope
    }
}

impl Drop for ConsoleScope {
    fn drop(&mut self) {
        CONSOLE.with(|slot| slot.borrow_mut().take());
    }
}

fn with_console<T>(f: impl FnOnce(&mut Console) -> T) -> Option<T> {
    CONSOLE.with(|slot| slot.borrow_mut().as_mut().map(f))
}

fn console_write(stream: Stream, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let text = match args.first() {
        Some(value) => value.to_string(context)?.to_std_string_escaped(),
        None => String::new(),
    };
    let accepted = with_console(|console| console.output(stream, format!("{}\n", text)));
    if accepted == Some(false) {
        return Err(JsNativeError::error()
            .with_message("output limit exceeded")
            .into());
    }
    Ok(JsValue::undefined())
}

fn native_stdout(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    console_write(Stream::Stdout, args, context)
}

fn native_stderr(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    console_write(Stream::Stderr, args, context)
}

fn describe_error(err: &JsError, context: &mut Context) -> String {
    // Thrown values go through their own toString ("Error: msg"),
    // engine errors through their native display
    if let Some(value) = err.as_opaque() {
        if let Ok(text) = value.to_string(context) {
            return text.to_std_string_escaped();
        }
    }
    err.to_string()
}

/// Loop iteration limits read as timeouts; recursion limits stay ordinary
/// runtime errors
fn hit_loop_limit(err: &JsError) -> bool {
    err.as_native().is_some_and(|native| {
        matches!(native.kind, JsNativeErrorKind::RuntimeLimit)
            && native.to_string().contains("loop iteration")
    })
}

fn render_completion(value: &JsValue, context: &mut Context) -> String {
    if let Some(text) = value.as_string() {
        return text.to_std_string_escaped();
    }
    if value.is_object() && !value.is_callable() {
        if let Ok(json) = value.to_json(context) {
            if let Ok(text) = serde_json::to_string(&json) {
                return text;
            }
        }
    }
    match value.to_string(context) {
        Ok(text) => text.to_std_string_escaped(),
        Err(_) => value.display().to_string(),
    }
}

fn build_context(loop_iteration_limit: u64) -> JsResult<Context> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(loop_iteration_limit);
    context.runtime_limits_mut().set_recursion_limit(RECURSION_LIMIT);
    context.register_global_builtin_callable(
        js_string!("__polyglot_stdout"),
        1,
        NativeFunction::from_fn_ptr(native_stdout),
    )?;
    context.register_global_builtin_callable(
        js_string!("__polyglot_stderr"),
        1,
        NativeFunction::from_fn_ptr(native_stderr),
    )?;
    context.eval(Source::from_bytes(CONSOLE_PRELUDE))?;
    Ok(context)
}

/// Evaluate `code` in a fresh context, writing frames to `out`.
///
/// The context has no filesystem, network or process access; the only
/// host capabilities are the console writers installed by the prelude.
/// A non-undefined completion value is written to stdout after the
/// script's own output. `Err` means the context itself could not be built.
pub fn evaluate(
    code: &str,
    settings: WorkerSettings,
    out: Box<dyn Write>,
    exit_when_spent: bool,
) -> JsResult<()> {
    let _scope = ConsoleScope::install(Console {
        out,
        remaining: settings.max_output_bytes,
        spent: false,
        exit_when_spent,
    });

    let mut context = build_context(settings.loop_iteration_limit)?;
    let outcome = context.eval(Source::from_bytes(code));

    if with_console(|console| console.spent).unwrap_or(false) {
        // Already reported as OutputLimit
        return Ok(());
    }
    match outcome {
        Ok(value) if value.is_undefined() => {}
        Ok(value) => {
            let rendered = format!("{}\n", render_completion(&value, &mut context));
            with_console(|console| console.output(Stream::Stdout, rendered));
        }
        Err(err) if hit_loop_limit(&err) => {
            with_console(|console| console.write(&WorkerFrame::LoopLimit));
        }
        Err(err) => {
            let message = describe_error(&err, &mut context);
            with_console(|console| console.write(&WorkerFrame::Threw { message }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    /// Writer whose bytes stay readable after evaluation took ownership
    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const SETTINGS: WorkerSettings = WorkerSettings {
        loop_iteration_limit: 1_000_000,
        max_output_bytes: 64 * 1024,
    };

    fn frames_with(code: &str, settings: WorkerSettings) -> Vec<WorkerFrame> {
        let buffer = SharedBuffer::default();
        evaluate(code, settings, Box::new(buffer.clone()), false).unwrap();
        let bytes = buffer.0.borrow().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn frames(code: &str) -> Vec<WorkerFrame> {
        frames_with(code, SETTINGS)
    }

    fn stdout(data: &str) -> WorkerFrame {
        WorkerFrame::Stdout { data: data.to_string() }
    }

    fn stderr(data: &str) -> WorkerFrame {
        WorkerFrame::Stderr { data: data.to_string() }
    }

    #[test]
    fn test_console_log_is_framed_per_call() {
        assert_eq!(
            frames("console.log('hello', 1 + 1); print('again');"),
            vec![stdout("hello 2\n"), stdout("again\n")]
        );
    }

    #[test]
    fn test_warn_and_error_go_to_stderr() {
        assert_eq!(
            frames("console.warn('careful'); console.error('bad');"),
            vec![stderr("careful\n"), stderr("bad\n")]
        );
    }

    #[test]
    fn test_completion_value_follows_output() {
        assert_eq!(frames("console.log('x'); 6 * 7"), vec![stdout("x\n"), stdout("42\n")]);
        assert_eq!(frames("({ a: 1, b: [true] })"), vec![stdout("{\"a\":1,\"b\":[true]}\n")]);
        assert_eq!(frames("'plain'"), vec![stdout("plain\n")]);
        assert!(frames("var x = 1;").is_empty());
    }

    #[test]
    fn test_objects_are_logged_as_json() {
        assert_eq!(frames("console.log({ n: 1 }, [1, 2])"), vec![stdout("{\"n\":1} [1,2]\n")]);
    }

    #[test]
    fn test_thrown_error_ends_with_threw_frame() {
        let frames = frames("console.log('before'); throw new Error('boom');");
        assert_eq!(frames[0], stdout("before\n"));
        match &frames[1] {
            WorkerFrame::Threw { message } => assert!(message.contains("boom"), "{}", message),
            other => panic!("expected Threw, got {:?}", other),
        }
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_reference_and_syntax_errors() {
        assert!(matches!(
            frames("undefinedFunction()").as_slice(),
            [WorkerFrame::Threw { message }] if message.contains("undefinedFunction")
        ));
        assert!(matches!(frames("loop forever").as_slice(), [WorkerFrame::Threw { .. }]));
    }

    #[test]
    fn test_no_host_capabilities() {
        assert_eq!(
            frames("typeof require + ' ' + typeof process + ' ' + typeof __polyglot_stdout"),
            vec![stdout("undefined undefined undefined\n")]
        );
    }

    #[test]
    fn test_loop_limit_is_reported() {
        let settings = WorkerSettings {
            loop_iteration_limit: 1_000,
            ..SETTINGS
        };
        assert_eq!(frames_with("for (;;) {}", settings), vec![WorkerFrame::LoopLimit]);
    }

    #[test]
    fn test_runaway_recursion_is_runtime_error() {
        assert!(matches!(
            frames("function f() { return f(); } f();").as_slice(),
            [WorkerFrame::Threw { .. }]
        ));
    }

    #[test]
    fn test_contexts_are_isolated() {
        frames("globalThis.leaked = 1;");
        assert_eq!(frames("typeof leaked"), vec![stdout("undefined\n")]);
    }

    #[test]
    fn test_output_budget_truncates_then_stops() {
        let settings = WorkerSettings {
            max_output_bytes: 10,
            ..SETTINGS
        };
        let frames = frames_with(
            "for (var i = 0; i < 100; i++) { try { console.log('abcd'); } catch (e) {} } 'done'",
            settings,
        );
        assert_eq!(
            frames,
            vec![
                stdout("abcd\n"),
                stdout("abcd\n"),
                stdout(TRUNCATION_MARKER),
                WorkerFrame::OutputLimit,
            ]
        );
    }

    #[test]
    fn test_settings_round_trip_through_args() {
        let args = SETTINGS.to_args();
        assert_eq!(args[0], WORKER_ARG);
        assert_eq!(WorkerSettings::from_args(&args), Some(SETTINGS));
        assert_eq!(WorkerSettings::from_args(&args[..2]), None);
        assert_eq!(
            WorkerSettings::from_args(&[WORKER_ARG.to_string(), "x".into(), "1".into()]),
            None
        );
    }

    #[test]
    fn test_frames_wire_shape() {
        assert_eq!(
            serde_json::to_string(&stdout("a\n")).unwrap(),
            r#"{"kind":"stdout","data":"a\n"}"#
        );
        assert_eq!(
            serde_json::to_string(&WorkerFrame::LoopLimit).unwrap(),
            r#"{"kind":"loop_limit"}"#
        );
    }
}
