use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline task.
///
/// Keys: `id`, `module`, `phase`, `default_label` (required); `provides`,
/// `after`, `config_path`, `core`, `effectful` (optional).
///
/// The annotated struct is the task's step config (read from
/// `<module>.steps.<step>` unless `config_path` says otherwise) and must have
/// `enabled: bool`, `label: Option<String>` and an inherent
/// `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Declares a module that owns a fixed list of `#[Task]` structs.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn string_list(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array of strings"));
    };
    elems.iter().map(lit_str).collect()
}

fn path_list(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array of task types"));
    };
    elems
        .iter()
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected task type path")),
        })
        .collect()
}

fn type_of(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        _ => Err(syn::Error::new(expr.span(), "expected config type path")),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| !(a.path().is_ident("Task") || a.path().is_ident("Module")))
        .cloned()
        .collect()
}

fn parse_pairs(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

#[derive(Default)]
struct TaskMeta {
    id: Option<String>,
    module: Option<String>,
    phase: Option<String>,
    config_path: Option<String>,
    default_label: Option<String>,
    provides: Vec<String>,
    after: Vec<String>,
    core: bool,
    effectful: bool,
}

fn default_step_path(module: &str, id: &str, span: proc_macro2::Span) -> syn::Result<String> {
    let Some(step) = id.strip_prefix(&format!("{module}.")) else {
        return Err(syn::Error::new(
            span,
            "Task: id must start with '<module>.' when config_path is omitted",
        ));
    };
    Ok(format!("{module}.steps.{}", step.replace('.', "_")))
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();
    let span = ident.span();

    let mut meta = TaskMeta::default();
    for (key, v, key_span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => meta.id = Some(lit_str(&v)?),
            "module" => meta.module = Some(lit_str(&v)?),
            "phase" => meta.phase = Some(lit_str(&v)?),
            "config_path" => meta.config_path = Some(lit_str(&v)?),
            "default_label" => meta.default_label = Some(lit_str(&v)?),
            "provides" => meta.provides = string_list(&v)?,
            "after" => meta.after = string_list(&v)?,
            "core" => meta.core = lit_bool(&v)?,
            "effectful" => meta.effectful = lit_bool(&v)?,
            other => {
                return Err(syn::Error::new(
                    key_span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = meta
        .id
        .ok_or_else(|| syn::Error::new(span, "Task: missing id"))?;
    let module = meta
        .module
        .ok_or_else(|| syn::Error::new(span, "Task: missing module"))?;
    let phase = meta
        .phase
        .ok_or_else(|| syn::Error::new(span, "Task: missing phase"))?;
    let default_label = meta
        .default_label
        .ok_or_else(|| syn::Error::new(span, "Task: missing default_label"))?;
    let config_path = match meta.config_path {
        Some(p) => p,
        None => default_step_path(&module, &id, span)?,
    };
    let provides = meta.provides;
    let after = meta.after;
    let core = meta.core;
    let effectful = meta.effectful;

    // Core steps cannot be switched off; optional ones plan and run as no-ops.
    let disabled_guard = if core {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::msg(format!(
                    "[{}].enabled=false is not allowed (core step)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const CORE: bool = #core;
            pub const EFFECTFUL: bool = #effectful;

            fn step_config(doc: &crate::config::ConfigDoc) -> crate::Result<Self> {
                Ok(doc.deserialize_path::<Self>(#config_path)?.unwrap_or_default())
            }

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg = Self::step_config(doc)?;
                #disabled_guard

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label: cfg.label.clone().unwrap_or_else(|| #default_label.to_string()),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg = Self::step_config(doc)?;
                #disabled_guard

                ctx.set_task(#id);
                if ctx.dry_run && Self::EFFECTFUL {
                    ctx.log(&format!("DRY-RUN: skipping {}", #id));
                    return Ok(());
                }
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();
    let span = ident.span();

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for (key, v, key_span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "config" => config_ty = Some(type_of(&v)?),
            "tasks" => tasks = Some(path_list(&v)?),
            other => {
                return Err(syn::Error::new(
                    key_span,
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(span, "Module: missing id"))?;
    let config_ty = config_ty.ok_or_else(|| syn::Error::new(span, "Module: missing config"))?;
    let tasks = tasks.ok_or_else(|| syn::Error::new(span, "Module: missing tasks"))?;

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    // The module's config lives at the table named after its id.
    let expanded = quote! {
        #st

        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#id)
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc.deserialize_path(#id)?.unwrap_or_default();
                if !cfg.enabled {
                    return Ok(());
                }
                #(#plan_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
