//! Shell integration snippets printed by `devpulse-hook init`.
//!
//! Each snippet reports the previous command after it finishes. The hook
//! runs in a detached subshell so the prompt never waits on it.

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
}

// The DEBUG trap also fires for every PROMPT_COMMAND entry. It only starts
// a measurement after `__devpulse_arm`, the last entry, has run and before
// `__devpulse_precmd`, the first one, disarms it again.
const BASH_SNIPPET: &str = r#"# devpulse shell integration (bash)
__devpulse_preexec() {
  [ -n "$COMP_LINE" ] && return
  [ "$__devpulse_armed" = 1 ] || return
  case "$BASH_COMMAND" in
    __devpulse_precmd*|__devpulse_arm*) return ;;
  esac
  __devpulse_armed=0
  __devpulse_start=$SECONDS
}
__devpulse_precmd() {
  local exit_code=$?
  __devpulse_armed=0
  if [ -n "$__devpulse_start" ]; then
    local cmd duration
    cmd=$(HISTTIMEFORMAT= history 1 | sed -e 's/^ *[0-9]\{1,\}\** *//')
    duration=$(( SECONDS - __devpulse_start ))
    if [ -n "$cmd" ]; then
      ( '__HOOK__' send --pwd "$PWD" --exit-code "$exit_code" --duration "$duration" -- "$cmd" >/dev/null 2>&1 & )
    fi
  fi
  unset __devpulse_start
  return $exit_code
}
__devpulse_arm() {
  __devpulse_armed=1
}
trap '__devpulse_preexec' DEBUG
case "$PROMPT_COMMAND" in
  *__devpulse_precmd*) ;;
  *)
    __devpulse_existing=$PROMPT_COMMAND
    while [[ $__devpulse_existing == *[[:space:]\;] ]]; do
      __devpulse_existing=${__devpulse_existing%?}
    done
    PROMPT_COMMAND="__devpulse_precmd${__devpulse_existing:+;$__devpulse_existing};__devpulse_arm"
    unset __devpulse_existing
    ;;
esac
"#;

const ZSH_SNIPPET: &str = r#"# devpulse shell integration (zsh)
zmodload zsh/datetime 2>/dev/null
__devpulse_preexec() {
  __devpulse_cmd=$1
  __devpulse_start=$EPOCHREALTIME
}
__devpulse_precmd() {
  local exit_code=$?
  if [[ -n $__devpulse_cmd ]]; then
    local duration=$(( EPOCHREALTIME - __devpulse_start ))
    ( '__HOOK__' send --pwd "$PWD" --exit-code "$exit_code" --duration "$duration" -- "$__devpulse_cmd" >/dev/null 2>&1 & )
  fi
  unset __devpulse_cmd
}
autoload -Uz add-zsh-hook
add-zsh-hook preexec __devpulse_preexec
add-zsh-hook precmd __devpulse_precmd
"#;

/// Snippet for `shell`, calling the hook at `hook_path`.
pub fn snippet(shell: Shell, hook_path: &str) -> String {
    let template = match shell {
        Shell::Bash => BASH_SNIPPET,
        Shell::Zsh => ZSH_SNIPPET,
    };
    template.replace("__HOOK__", &single_quote_escape(hook_path))
}

// Inside a single-quoted string, a quote is written as '\''.
fn single_quote_escape(value: &str) -> String {
    value.replace('\'', r"'\''")
}
