#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "model",
        action: "set_model",
    },
    CommandSpec {
        command: "docs",
        action: "set_docs",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "image",
        action: "attach_image",
    },
    CommandSpec {
        command: "out",
        action: "set_out_dir",
    },
];

/// `/saveas <scenario|simulation> <path>` takes a target plus one path.
pub(crate) const SAVEAS_COMMAND: CommandSpec = CommandSpec {
    command: "saveas",
    action: "save_as",
};

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/model",
    "/models",
    "/image",
    "/out",
    "/docs",
    "/saveas",
    "/status",
    "/help",
    "/quit",
];
