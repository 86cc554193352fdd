/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    /// One line, listed by `gale explain`.
    pub short: &'static str,
    pub long: &'static str,
}

/// Every stable code a gale diagnostic can carry.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Files ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "GALE-F001",
        short: "cannot read source file",
        long: r#"## GALE-F001: cannot read source file

The entry file or one of its imports could not be read. Check the
path and its permissions. Imports are resolved relative to the file
that names them.
"#,
    },
    ErrorEntry {
        code: "GALE-F002",
        short: "invalid config file",
        long: r#"## GALE-F002: invalid config file

The file passed with `--config` is missing or is not valid JSON.
Recognised keys are `max_steps`, `max_allocations`, `max_frames` and
`trusted`; missing keys keep their defaults.

    { "max_steps": 100000, "trusted": false }
"#,
    },
    // ── Lexer ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "GALE-L001",
        short: "unexpected character",
        long: r#"## GALE-L001: unexpected character

A character was found that does not start any token.

    let price = 4 # 2;

`#` is not an operator. Remove it or replace it with one.
"#,
    },
    // ── Parser ───────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "GALE-P001",
        short: "unexpected end of input",
        long: r#"## GALE-P001: unexpected end of input

The file ended in the middle of a statement or expression.

    let total = 1 +
"#,
    },
    ErrorEntry {
        code: "GALE-P002",
        short: "unexpected token",
        long: r#"## GALE-P002: unexpected token

An expression was expected but the next token cannot start one.

    let y = x +* 2;
"#,
    },
    ErrorEntry {
        code: "GALE-P003",
        short: "expected a different token",
        long: r#"## GALE-P003: expected a different token

The grammar requires a specific token here, such as the `(` after
`if` or the `;` closing a statement.

    if x > 1 { ... }

**Fix:**

    if (x > 1) { ... }
"#,
    },
    ErrorEntry {
        code: "GALE-P004",
        short: "expected a token, got end of input",
        long: r#"## GALE-P004: expected a token, got end of input

Like GALE-P003, but the file ended before the required token.
Usually a missing `)` or `]`.
"#,
    },
    ErrorEntry {
        code: "GALE-P005",
        short: "expected identifier",
        long: r#"## GALE-P005: expected identifier

A name was required, for a variable, function, parameter or class.

    let = 5;
    function (a) {}
"#,
    },
    ErrorEntry {
        code: "GALE-P006",
        short: "expected identifier, got end of input",
        long: r#"## GALE-P006: expected identifier, got end of input

The file ended where a name was required.
"#,
    },
    ErrorEntry {
        code: "GALE-P007",
        short: "unclosed block",
        long: r#"## GALE-P007: unclosed block

A `{`, `(` or `[` was opened and the file ended before it was closed.
Check for a missing `}` at the end of a function, class or block.
"#,
    },
    ErrorEntry {
        code: "GALE-P010",
        short: "expected a module path",
        long: r#"## GALE-P010: expected a module path

`import` takes a string literal naming the file to load.

    import "./util";
    import * as util from "./util";
"#,
    },
    ErrorEntry {
        code: "GALE-P011",
        short: "invalid labelled statement",
        long: r#"## GALE-P011: invalid labelled statement

A label must be followed by a single statement, normally a loop.

    outer: for (let i = 0; i < 3; i++) { ... }
"#,
    },
    ErrorEntry {
        code: "GALE-P012",
        short: "expected a declaration after export",
        long: r#"## GALE-P012: expected a declaration after export

`export` applies to `function`, `class`, `enum`, `let`, `const`
and `var` declarations only.

    export function area(r) { return math.pi * r * r; }
"#,
    },
    ErrorEntry {
        code: "GALE-P013",
        short: "invalid switch body",
        long: r#"## GALE-P013: invalid switch body

Every statement in a `switch` body belongs to a `case` or the
`default` clause.

    switch (x) {
        case 1: return "one";
        default: return "many";
    }
"#,
    },
    ErrorEntry {
        code: "GALE-P014",
        short: "try without catch or finally",
        long: r#"## GALE-P014: try without catch or finally

A `try` block must be followed by `catch`, `finally` or both.

    try { risky(); } catch (e) { console.log(e.message); }
"#,
    },
    ErrorEntry {
        code: "GALE-P015",
        short: "rest parameter must be last",
        long: r#"## GALE-P015: rest parameter must be last

Only the final parameter may be a rest parameter.

    function log(level, ...parts) {}
"#,
    },
    ErrorEntry {
        code: "GALE-P016",
        short: "spread argument must be last",
        long: r#"## GALE-P016: spread argument must be last

A spread argument collects the remaining arguments, so nothing may
follow it.

    log("info", ...parts);
"#,
    },
    ErrorEntry {
        code: "GALE-P020",
        short: "expected a type",
        long: r#"## GALE-P020: expected a type

A `:` annotation was not followed by a type. Annotations are checked
for syntax only and are ignored when the program runs.

    let n: number = 1;
"#,
    },
    ErrorEntry {
        code: "GALE-P021",
        short: "unclosed type arguments",
        long: r#"## GALE-P021: unclosed type arguments

A `<` opening type arguments was never matched by `>`.

    let xs: Array<number = [];
"#,
    },
    ErrorEntry {
        code: "GALE-P022",
        short: "expected interface body",
        long: r#"## GALE-P022: expected interface body

An `interface` declaration needs a `{ ... }` body.
"#,
    },
    // ── Compiler ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "GALE-C001",
        short: "compile error",
        long: r#"## GALE-C001: compile error

The program parsed but cannot be compiled. Common causes:

- an undeclared identifier, or a name the imported module does not export
- a duplicate declaration in the same block
- `break` or `continue` outside a loop, or to an unknown label
- `return`, `break` or `continue` leaving a `finally` block
"#,
    },
    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "GALE-R001",
        short: "uncaught runtime error",
        long: r#"## GALE-R001: uncaught runtime error

An error was thrown and no `catch` handled it. The notes list the
call stack, innermost first. `finally` blocks on the way out have
already run.

    function div(a, b) { return a / b; }
    div(1, 0);   // Attempt to divide by zero
"#,
    },
    ErrorEntry {
        code: "GALE-R002",
        short: "resource limit exceeded",
        long: r#"## GALE-R002: resource limit exceeded

The program ran past `--max-steps`, `--max-allocations` or
`--max-frames`. Limit errors cannot be caught by the script. Raise
the limit or set it to 0 to disable it.
"#,
    },
    ErrorEntry {
        code: "GALE-R003",
        short: "panic",
        long: r#"## GALE-R003: panic

The script called `panic(message)` or a native function failed
unexpectedly. A panic cannot be caught and stops the program.
"#,
    },
];

/// Look up an error entry by code (e.g. `"GALE-P005"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_code() {
        let e = lookup("GALE-P014").expect("GALE-P014 should be registered");
        assert_eq!(e.short, "try without catch or finally");
        assert!(e.long.starts_with("## GALE-P014"));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("GALE-X999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn codes_are_unique_and_documented() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), REGISTRY.len(), "duplicate codes in registry");
        for entry in REGISTRY {
            assert!(entry.long.starts_with(&format!("## {}: {}", entry.code, entry.short)), "{}", entry.code);
        }
    }

    #[test]
    fn parser_codes_are_registered() {
        let source = include_str!("../parser/mod.rs");
        for (i, _) in source.match_indices("\"GALE-P") {
            let code = &source[i + 1..i + 10];
            assert!(lookup(code).is_some(), "{code} is not registered");
        }
    }
}
