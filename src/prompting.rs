use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub customer_state: &'a str,
    pub customer_note: &'a str,
    pub typebot_block: &'a str,
    pub properties_block: &'a str,
    pub site_base_url: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            customer_state => ctx.customer_state,
            customer_note => ctx.customer_note,
            typebot_block => ctx.typebot_block,
            properties_block => ctx.properties_block,
            site_base_url => ctx.site_base_url,
            has_typebot => !ctx.typebot_block.trim().is_empty(),
            has_properties => !ctx.properties_block.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "Você é a Helena, SDR da imobiliária. Atenda em português, de forma breve e cordial.\n\
         Antes de oferecer detalhes de qualquer imóvel, pergunte se o cliente prefere ser \
         atendido por um consultor humano ou quer que eu mesma continue o atendimento.\n\
         Nunca invente imóveis que não estejam na lista.\n\
         Estado do cliente: {}.\n",
        ctx.customer_state
    );

    if !ctx.customer_note.trim().is_empty() {
        prompt.push_str(ctx.customer_note.trim());
        prompt.push('\n');
    }

    if !ctx.typebot_block.trim().is_empty() {
        prompt.push_str("\nDados já informados pelo cliente no formulário:\n");
        prompt.push_str(ctx.typebot_block.trim());
        prompt.push('\n');
    }

    if !ctx.properties_block.trim().is_empty() {
        prompt.push_str("\nImóveis ativos:\n");
        prompt.push_str(ctx.properties_block.trim());
        prompt.push('\n');
    }

    prompt
}
