extern crate proc_macro;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use std::collections::HashSet;
use syn::ext::IdentExt;
use syn::parse::{Parse, ParseStream};
use syn::{bracketed, parenthesized, Expr, Ident, Result, Token};

enum TermArg {
    Variable(Ident),
    Constant(Expr),
}

enum ArgumentArg {
    Positional(TermArg),
    Named(Ident, TermArg),
}

struct AtomArgs {
    negated: bool,
    modal: Option<Ident>,
    service: Option<Ident>,
    name: Ident,
    args: Vec<ArgumentArg>,
}

impl AtomArgs {
    fn variables(&self) -> impl Iterator<Item = &Ident> {
        self.args.iter().filter_map(|arg| match arg {
            ArgumentArg::Positional(TermArg::Variable(ident)) => Some(ident),
            ArgumentArg::Named(_, TermArg::Variable(ident)) => Some(ident),
            _ => None,
        })
    }
}

struct RuleMacroInput {
    head: AtomArgs,
    body: Vec<AtomArgs>,
}

fn parse_term(p: ParseStream) -> Result<TermArg> {
    if p.peek(Token![?]) {
        p.parse::<Token![?]>()?;
        Ok(TermArg::Variable(p.call(Ident::parse_any)?))
    } else {
        Ok(TermArg::Constant(p.parse()?))
    }
}

impl Parse for RuleMacroInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let head = input.parse::<AtomArgs>()?;

        input.parse::<Token![<-]>()?;
        let content;
        bracketed!(content in input);
        let body: syn::punctuated::Punctuated<AtomArgs, Token![,]> =
            content.parse_terminated(AtomArgs::parse)?;
        let body_vec: Vec<AtomArgs> = body.into_iter().collect();

        let body_variables: HashSet<String> = body_vec
            .iter()
            .flat_map(|atom| atom.variables())
            .map(|ident| ident.to_string())
            .collect();

        for variable in head.variables() {
            if !body_variables.contains(&variable.to_string()) {
                return Err(syn::Error::new(
                    variable.span(),
                    format!("variable {} was not found in the body", variable),
                ));
            }
        }

        Ok(RuleMacroInput {
            head,
            body: body_vec,
        })
    }
}

impl Parse for AtomArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        let negated = if input.peek(Token![!]) {
            input.parse::<Token![!]>()?;
            true
        } else {
            false
        };
        let first = input.call(Ident::parse_any)?;

        if input.peek(syn::token::Bracket) {
            let content;
            bracketed!(content in input);
            let mut inner: AtomArgs = content.parse()?;
            inner.modal = Some(first);
            inner.negated |= negated;

            return Ok(inner);
        }

        let (service, name) = if input.peek(Token![:]) && !input.peek(Token![::]) {
            input.parse::<Token![:]>()?;
            (Some(first), input.call(Ident::parse_any)?)
        } else {
            (None, first)
        };

        let content;
        parenthesized!(content in input);
        let args: syn::punctuated::Punctuated<ArgumentArg, Token![,]> =
            content.parse_terminated(|p| {
                if p.peek(Ident) && p.peek2(Token![=]) && !p.peek2(Token![==]) {
                    let column: Ident = p.parse()?;
                    p.parse::<Token![=]>()?;
                    Ok(ArgumentArg::Named(column, parse_term(p)?))
                } else {
                    Ok(ArgumentArg::Positional(parse_term(p)?))
                }
            })?;

        Ok(AtomArgs {
            negated,
            modal: None,
            service,
            name,
            args: args.into_iter().collect(),
        })
    }
}

fn term_tokens(arg: &TermArg) -> TokenStream2 {
    match arg {
        TermArg::Variable(ident) => quote! { Term::Variable(stringify!(#ident).to_string()) },
        TermArg::Constant(expr) => quote! { Term::Constant(TypedValue::from(#expr)) },
    }
}

fn atom_tokens(atom: &AtomArgs) -> TokenStream2 {
    let name = &atom.name;
    let negated = atom.negated;
    let service = match &atom.service {
        Some(service) => quote! { Some(stringify!(#service).to_string()) },
        None => quote! { None },
    };
    let modal = match &atom.modal {
        Some(modal) => quote! { Some(stringify!(#modal).to_string()) },
        None => quote! { None },
    };
    let positional: Vec<_> = atom
        .args
        .iter()
        .filter_map(|arg| match arg {
            ArgumentArg::Positional(term) => Some(term_tokens(term)),
            ArgumentArg::Named(_, _) => None,
        })
        .collect();
    let named: Vec<_> = atom
        .args
        .iter()
        .filter_map(|arg| match arg {
            ArgumentArg::Named(column, term) => {
                let term = term_tokens(term);
                Some(quote! { named_arguments.insert(stringify!(#column).to_string(), #term); })
            }
            ArgumentArg::Positional(_) => None,
        })
        .collect();

    quote! {
        {
            #[allow(unused_mut)]
            let mut named_arguments = ::std::collections::BTreeMap::new();
            #(#named)*
            Literal {
                table: Tablename {
                    table: stringify!(#name).to_string(),
                    service: #service,
                    modal: #modal,
                },
                arguments: vec![#(#positional),*],
                named_arguments,
                negated: #negated,
            }
        }
    }
}

fn rule_tokens(rule: &RuleMacroInput) -> TokenStream2 {
    let head = atom_tokens(&rule.head);
    let body: Vec<_> = rule.body.iter().map(atom_tokens).collect();

    quote! {
        Rule::new(#head, vec![#(#body),*])
    }
}

#[proc_macro]
pub fn literal(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as AtomArgs);

    atom_tokens(&input).into()
}

#[proc_macro]
pub fn rule(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as RuleMacroInput);

    rule_tokens(&input).into()
}

struct ProgramMacroInput {
    rules: syn::punctuated::Punctuated<RuleMacroInput, Token![,]>,
}

impl Parse for ProgramMacroInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let rules = input.parse_terminated(RuleMacroInput::parse)?;
        Ok(ProgramMacroInput { rules })
    }
}

#[proc_macro]
pub fn program(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as ProgramMacroInput);

    let rules: Vec<_> = input.rules.iter().map(rule_tokens).collect();

    let expanded = quote! {
        vec![#(#rules),*]
    };

    expanded.into()
}
